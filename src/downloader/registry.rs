//! 任务注册表
//!
//! 下载任务状态机的唯一权威：持有 Active / Completed / Failed 三个分区和已下载记录的内存镜像。
//! 所有修改都由单一消费者（管理器事件循环）串行执行，因此不需要锁
//!
//! 合法转换：
//! - Active -> Completed / Failed（工作者终止事件）
//! - Completed / Failed -> Active（重新下载，或再次提交）
//! - Completed -> 移除（删除产物）

use crate::catalog::CatalogLookup;
use crate::config::DownloadDirProvider;
use crate::downloader::{
    DownloadExecutor, DownloadJob, DownloadRequest, DownloadTask, ErrorClass, ProgressSender,
    RegistryError, TaskState, WorkerEvent,
};
use crate::filesystem::{artifact_exists, delete_artifact, resolve_local_path};
use crate::persistence::RecordStore;
use crate::server::events::TaskNotification;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 活跃任务及其取消令牌
#[derive(Debug)]
struct ActiveEntry {
    task: DownloadTask,
    cancel: CancellationToken,
}

/// 三个分区的快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub active: Vec<DownloadTask>,
    pub completed: Vec<DownloadTask>,
    pub failed: Vec<DownloadTask>,
}

impl RegistrySnapshot {
    pub fn state_of(&self, identity: &str) -> Option<TaskState> {
        self.find(identity).map(|task| task.state)
    }

    pub fn find(&self, identity: &str) -> Option<&DownloadTask> {
        self.active
            .iter()
            .chain(self.completed.iter())
            .chain(self.failed.iter())
            .find(|task| task.identity == identity)
    }
}

/// 启动对账结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// 文件存在，进入 Completed
    pub verified: Vec<String>,
    /// 文件缺失或目录中已不存在，从记录中移除
    pub dropped: Vec<String>,
    /// 目录未加载，无法计算文件名，记录暂时保留
    pub deferred: Vec<String>,
}

/// 任务注册表
pub struct TaskRegistry {
    active: HashMap<String, ActiveEntry>,
    completed: HashMap<String, DownloadTask>,
    failed: HashMap<String, DownloadTask>,
    store: RecordStore,
    executor: Arc<dyn DownloadExecutor>,
    dir_provider: Arc<dyn DownloadDirProvider>,
    catalog: Arc<dyn CatalogLookup>,
    progress_tx: ProgressSender,
    notifier: broadcast::Sender<TaskNotification>,
    next_attempt: u64,
}

impl TaskRegistry {
    pub fn new(
        store: RecordStore,
        executor: Arc<dyn DownloadExecutor>,
        dir_provider: Arc<dyn DownloadDirProvider>,
        catalog: Arc<dyn CatalogLookup>,
        progress_tx: ProgressSender,
        notifier: broadcast::Sender<TaskNotification>,
    ) -> Self {
        Self {
            active: HashMap::new(),
            completed: HashMap::new(),
            failed: HashMap::new(),
            store,
            executor,
            dir_provider,
            catalog,
            progress_tx,
            notifier,
            next_attempt: 1,
        }
    }

    /// 启动对账
    ///
    /// 对每个已持久化的标识重新计算期望路径并校验文件存在；
    /// 文件缺失或目录已不认识的标识被丢弃，记录文件只重写一次。
    /// 目录加载失败时，目录中查不到的标识保留在记录中，等下次启动再校验
    pub fn reconcile(&mut self) -> ReconcileReport {
        let download_dir = self.dir_provider.download_dir();
        let catalog = self.catalog.clone();
        let catalog_loaded = catalog.is_loaded();
        let mut verified = Vec::new();
        let mut deferred = Vec::new();

        let dropped = self.store.retain(|identity| {
            let Some(metadata) = catalog.lookup(identity) else {
                if !catalog_loaded {
                    warn!("应用目录未加载，暂时保留记录: {}", identity);
                    deferred.push(identity.to_string());
                    return true;
                }
                warn!("应用目录中不存在已记录的标识，移除记录: {}", identity);
                return false;
            };
            let path = resolve_local_path(&download_dir, &metadata.target_filename());
            if artifact_exists(&path) {
                verified.push((identity.to_string(), metadata, path));
                true
            } else {
                info!("已下载文件不存在，移除记录: {} -> {:?}", identity, path);
                false
            }
        });

        if !dropped.is_empty() {
            self.persist_store();
        }

        let mut report = ReconcileReport {
            verified: Vec::with_capacity(verified.len()),
            dropped,
            deferred,
        };

        for (identity, metadata, path) in verified {
            let source_url = catalog.source_url(&identity).unwrap_or_default();
            let attempt = self.next_attempt();
            let mut task = DownloadTask::new(identity.clone(), source_url, metadata, attempt);
            task.local_path = Some(path);
            task.mark_completed();

            self.active.remove(&identity);
            self.failed.remove(&identity);
            self.completed.insert(identity.clone(), task);
            report.verified.push(identity);
        }

        info!(
            "启动对账完成: 保留 {} 个, 移除 {} 个, 暂缓 {} 个",
            report.verified.len(),
            report.dropped.len(),
            report.deferred.len()
        );
        report
    }

    /// 提交下载请求
    ///
    /// 标识已在下载中时拒绝；已完成或失败的同名任务被新的尝试取代。
    /// 没有下载链接的提交不能取代已完成任务，产物和记录保持不变
    pub fn submit(&mut self, request: DownloadRequest) -> Result<DownloadTask, RegistryError> {
        let identity = request.identity();

        if self.active.contains_key(&identity) {
            warn!("任务已在下载中，拒绝重复提交: {}", identity);
            return Err(RegistryError::AlreadyActive(identity));
        }

        let metadata = request.metadata();
        let Some(url) = request.source_url() else {
            if self.completed.contains_key(&identity) {
                warn!("没有下载链接，保留已完成任务: {}", identity);
                return Err(self.invalid_transition(&identity, TaskState::Completed, "submit"));
            }
            self.supersede(&identity);
            let attempt = self.next_attempt();
            let task = DownloadTask::new(identity, String::new(), metadata, attempt);
            return Ok(self.fail_without_link(task));
        };
        let task = DownloadTask::new(identity, url.to_string(), metadata, 0);

        self.supersede(&task.identity);
        Ok(self.start_attempt(task))
    }

    /// 重新下载，仅对 Completed / Failed 有效
    pub fn redownload(&mut self, identity: &str) -> Result<DownloadTask, RegistryError> {
        if self.active.contains_key(identity) {
            return Err(self.invalid_transition(identity, TaskState::Active, "redownload"));
        }

        let mut task = if let Some(task) = self.completed.remove(identity) {
            if self.store.remove(identity) {
                self.persist_store();
            }
            task
        } else if let Some(task) = self.failed.remove(identity) {
            task
        } else {
            return Err(RegistryError::NotFound(identity.to_string()));
        };

        if task.source_url.trim().is_empty() {
            if let Some(url) = self.catalog.source_url(identity) {
                task.source_url = url;
            }
        }
        if task.source_url.trim().is_empty() {
            task.restart(self.next_attempt());
            return Ok(self.fail_without_link(task));
        }

        info!("重新下载: {}", identity);
        Ok(self.start_attempt(task))
    }

    /// 删除产物，仅对 Completed 有效
    ///
    /// 文件已不存在视为成功；其他删除失败时状态保持不变并返回错误
    pub fn delete_artifact(&mut self, identity: &str) -> Result<(), RegistryError> {
        let Some(task) = self.completed.get(identity) else {
            return Err(match self.state_of(identity) {
                Some(state) => self.invalid_transition(identity, state, "delete"),
                None => RegistryError::NotFound(identity.to_string()),
            });
        };

        let path = resolve_local_path(&self.dir_provider.download_dir(), &task.target_filename);
        match delete_artifact(&path) {
            Ok(true) => info!("已删除产物: {} -> {:?}", identity, path),
            Ok(false) => info!("产物已不存在，仅移除记录: {} -> {:?}", identity, path),
            Err(e) => {
                error!("删除产物失败: {} -> {:?}, 错误: {}", identity, path, e);
                return Err(RegistryError::DeleteFailed {
                    identity: identity.to_string(),
                    path,
                    source: e,
                });
            }
        }

        self.completed.remove(identity);
        if self.store.remove(identity) {
            self.persist_store();
        }
        self.notify(TaskNotification::Deleted {
            identity: identity.to_string(),
        });
        Ok(())
    }

    /// 请求取消，仅对 Active 有效
    ///
    /// 只发出取消信号，任务在工作者上报终止事件后进入 Failed
    pub fn cancel(&mut self, identity: &str) -> Result<(), RegistryError> {
        match self.active.get(identity) {
            Some(entry) => {
                info!("请求取消下载: {}", identity);
                entry.cancel.cancel();
                Ok(())
            }
            None => Err(match self.state_of(identity) {
                Some(state) => self.invalid_transition(identity, state, "cancel"),
                None => RegistryError::NotFound(identity.to_string()),
            }),
        }
    }

    /// 取消所有活跃任务（关闭时使用）
    pub fn cancel_all(&mut self) -> usize {
        for entry in self.active.values() {
            entry.cancel.cancel();
        }
        self.active.len()
    }

    /// 处理工作者事件
    ///
    /// 不在 Active 中的标识，或尝试序号不匹配的事件一律忽略
    pub fn handle_event(&mut self, event: WorkerEvent) {
        match self.active.get(event.identity()) {
            Some(entry) if entry.task.attempt == event.attempt() => {}
            Some(entry) => {
                debug!(
                    "忽略过期尝试的事件: {} (attempt={}, 当前={})",
                    event.identity(),
                    event.attempt(),
                    entry.task.attempt
                );
                return;
            }
            None => {
                debug!("忽略非活跃任务的事件: {}", event.identity());
                return;
            }
        }

        match event {
            WorkerEvent::Progress {
                identity, percent, ..
            } => {
                let Some(entry) = self.active.get_mut(&identity) else {
                    return;
                };
                if entry.task.update_progress(percent) {
                    self.notify(TaskNotification::Progress { identity, percent });
                }
            }
            WorkerEvent::Success {
                identity,
                local_path,
                ..
            } => {
                let Some(ActiveEntry { mut task, .. }) = self.active.remove(&identity) else {
                    return;
                };

                if !artifact_exists(&local_path) {
                    error!("下载完成但文件不存在: {} -> {:?}", identity, local_path);
                    let detail = format!("下载完成但文件不存在: {}", local_path.display());
                    task.mark_failed(ErrorClass::Filesystem, detail.clone());
                    self.failed.insert(identity.clone(), task);
                    self.notify(TaskNotification::failed(
                        &identity,
                        ErrorClass::Filesystem,
                        &detail,
                    ));
                    return;
                }

                info!("任务完成: {} -> {:?}", identity, local_path);
                task.local_path = Some(local_path.clone());
                task.mark_completed();
                self.completed.insert(identity.clone(), task);
                if self.store.insert(&identity) {
                    self.persist_store();
                }
                self.notify(TaskNotification::Completed {
                    identity,
                    local_path: local_path.to_string_lossy().to_string(),
                });
            }
            WorkerEvent::Failure {
                identity, failure, ..
            } => {
                let Some(ActiveEntry { mut task, .. }) = self.active.remove(&identity) else {
                    return;
                };

                info!(
                    "任务失败: {} class={:?} detail={}",
                    identity, failure.class, failure.detail
                );
                task.mark_failed(failure.class, failure.detail.clone());
                self.failed.insert(identity.clone(), task);
                self.notify(TaskNotification::failed(
                    &identity,
                    failure.class,
                    &failure.detail,
                ));
            }
        }
    }

    pub fn get(&self, identity: &str) -> Option<DownloadTask> {
        self.active
            .get(identity)
            .map(|entry| &entry.task)
            .or_else(|| self.completed.get(identity))
            .or_else(|| self.failed.get(identity))
            .cloned()
    }

    pub fn state_of(&self, identity: &str) -> Option<TaskState> {
        if self.active.contains_key(identity) {
            Some(TaskState::Active)
        } else if self.completed.contains_key(identity) {
            Some(TaskState::Completed)
        } else if self.failed.contains_key(identity) {
            Some(TaskState::Failed)
        } else {
            None
        }
    }

    /// 所有分区的快照，按创建时间排序
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot {
            active: self.active.values().map(|e| e.task.clone()).collect(),
            completed: self.completed.values().cloned().collect(),
            failed: self.failed.values().cloned().collect(),
        };
        for list in [
            &mut snapshot.active,
            &mut snapshot.completed,
            &mut snapshot.failed,
        ] {
            list.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.identity.cmp(&b.identity))
            });
        }
        snapshot
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// 是否已记录为已下载
    pub fn is_recorded(&self, identity: &str) -> bool {
        self.store.contains(identity)
    }

    /// 移除已完成或失败的旧任务，已完成的同时移除记录
    fn supersede(&mut self, identity: &str) {
        if self.completed.remove(identity).is_some() {
            debug!("新的提交取代已完成任务: {}", identity);
            if self.store.remove(identity) {
                self.persist_store();
            }
        }
        if self.failed.remove(identity).is_some() {
            debug!("新的提交取代失败任务: {}", identity);
        }
    }

    /// 启动一次新的下载尝试并放入 Active
    fn start_attempt(&mut self, mut task: DownloadTask) -> DownloadTask {
        task.restart(self.next_attempt());

        let download_dir = self.dir_provider.download_dir();
        let local_path = resolve_local_path(&download_dir, &task.target_filename);
        task.local_path = Some(local_path.clone());

        let cancel = CancellationToken::new();
        let job = DownloadJob {
            identity: task.identity.clone(),
            attempt: task.attempt,
            source_url: task.source_url.clone(),
            local_path: local_path.clone(),
            cancel: cancel.clone(),
        };
        let reporter = self.progress_tx.reporter(&task.identity, task.attempt);

        info!(
            "启动下载: {} (attempt={}) -> {:?}",
            task.identity, task.attempt, local_path
        );
        self.active.insert(
            task.identity.clone(),
            ActiveEntry {
                task: task.clone(),
                cancel,
            },
        );
        self.executor.start(job, reporter);

        self.notify(TaskNotification::Started {
            identity: task.identity.clone(),
            attempt: task.attempt,
            local_path: local_path.to_string_lossy().to_string(),
        });
        task
    }

    /// 没有下载链接：直接进入 Failed，不启动工作者
    fn fail_without_link(&mut self, mut task: DownloadTask) -> DownloadTask {
        let class = ErrorClass::NoDownloadLink;
        warn!("没有可用的下载链接: {}", task.identity);
        task.mark_failed(class, class.summary().to_string());
        self.failed.insert(task.identity.clone(), task.clone());
        self.notify(TaskNotification::failed(
            &task.identity,
            class,
            class.summary(),
        ));
        task
    }

    fn invalid_transition(
        &self,
        identity: &str,
        state: TaskState,
        operation: &'static str,
    ) -> RegistryError {
        warn!("非法操作: {} 处于 {} 状态，不能执行 {}", identity, state, operation);
        RegistryError::InvalidTransition {
            identity: identity.to_string(),
            state,
            operation,
        }
    }

    fn next_attempt(&mut self) -> u64 {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        attempt
    }

    fn persist_store(&self) {
        if let Err(e) = self.store.save() {
            error!("保存已下载记录失败: {:?}, 错误: {}", self.store.path(), e);
        }
    }

    fn notify(&self, notification: TaskNotification) {
        // 没有订阅者时发送失败，忽略
        let _ = self.notifier.send(notification);
    }
}

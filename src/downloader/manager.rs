//! 下载管理器
//!
//! 注册表的异步句柄：命令经 mpsc 发往后台事件循环，结果通过 oneshot 返回

use crate::catalog::CatalogLookup;
use crate::config::{AppConfig, DownloadDirProvider};
use crate::downloader::{
    progress_channel, DownloadExecutor, DownloadRequest, DownloadTask, DownloadWorker,
    ProgressReceiver, ReconcileReport, RegistryError, RegistrySnapshot, TaskRegistry,
};
use crate::persistence::RecordStore;
use crate::server::events::TaskNotification;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// 命令队列容量
const COMMAND_BUFFER: usize = 256;

/// 通知广播容量，落后的订阅者会跳过旧事件
const NOTIFICATION_BUFFER: usize = 1024;

/// 关闭时等待工作者清理的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Reply<T> = oneshot::Sender<Result<T, RegistryError>>;

/// 发往事件循环的命令
enum Command {
    Submit {
        request: DownloadRequest,
        reply: Reply<DownloadTask>,
    },
    Redownload {
        identity: String,
        reply: Reply<DownloadTask>,
    },
    Delete {
        identity: String,
        reply: Reply<()>,
    },
    Cancel {
        identity: String,
        reply: Reply<()>,
    },
    Get {
        identity: String,
        reply: oneshot::Sender<Option<DownloadTask>>,
    },
    Snapshot {
        reply: oneshot::Sender<RegistrySnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// 下载管理器
///
/// 可克隆的句柄。注册表由后台事件循环独占，命令和工作者事件在同一个循环中串行处理
#[derive(Debug, Clone)]
pub struct DownloadManager {
    commands: mpsc::Sender<Command>,
    notifier: broadcast::Sender<TaskNotification>,
}

impl DownloadManager {
    /// 按配置创建管理器：HTTP 工作者 + 配置中的记录文件
    ///
    /// 返回启动对账结果
    pub fn new(
        config: &AppConfig,
        dir_provider: Arc<dyn DownloadDirProvider>,
        catalog: Arc<dyn CatalogLookup>,
    ) -> Result<(Self, ReconcileReport)> {
        let executor = Arc::new(DownloadWorker::new(&config.download)?);
        let store = RecordStore::load(config.persistence.record_path());

        info!(
            "创建下载管理器: 分片大小={}KB, 记录文件={:?}",
            config.download.chunk_size_bytes() / 1024,
            store.path()
        );

        Ok(Self::with_executor(store, executor, dir_provider, catalog))
    }

    /// 使用指定执行器创建管理器，启动对账后开始事件循环
    pub fn with_executor(
        store: RecordStore,
        executor: Arc<dyn DownloadExecutor>,
        dir_provider: Arc<dyn DownloadDirProvider>,
        catalog: Arc<dyn CatalogLookup>,
    ) -> (Self, ReconcileReport) {
        let (progress_tx, progress_rx) = progress_channel();
        let (notifier, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let mut registry = TaskRegistry::new(
            store,
            executor,
            dir_provider,
            catalog,
            progress_tx,
            notifier.clone(),
        );
        let report = registry.reconcile();

        tokio::spawn(run_event_loop(registry, command_rx, progress_rx));

        (Self { commands, notifier }, report)
    }

    pub async fn submit(&self, request: DownloadRequest) -> Result<DownloadTask, RegistryError> {
        self.call(|reply| Command::Submit { request, reply }).await?
    }

    pub async fn redownload(&self, identity: &str) -> Result<DownloadTask, RegistryError> {
        let identity = identity.to_string();
        self.call(|reply| Command::Redownload { identity, reply })
            .await?
    }

    pub async fn delete_artifact(&self, identity: &str) -> Result<(), RegistryError> {
        let identity = identity.to_string();
        self.call(|reply| Command::Delete { identity, reply }).await?
    }

    pub async fn cancel(&self, identity: &str) -> Result<(), RegistryError> {
        let identity = identity.to_string();
        self.call(|reply| Command::Cancel { identity, reply }).await?
    }

    pub async fn get(&self, identity: &str) -> Result<Option<DownloadTask>, RegistryError> {
        let identity = identity.to_string();
        self.call(|reply| Command::Get { identity, reply }).await
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    /// 订阅任务通知
    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.notifier.subscribe()
    }

    /// 取消所有活跃任务并停止事件循环
    pub async fn shutdown(&self) {
        match self.call(|reply| Command::Shutdown { reply }).await {
            Ok(()) => info!("下载管理器已关闭"),
            Err(_) => debug!("下载管理器已经停止"),
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| RegistryError::ManagerStopped)?;
        response.await.map_err(|_| RegistryError::ManagerStopped)
    }
}

/// 单一消费者循环：命令与工作者事件都在这里修改注册表
async fn run_event_loop(
    mut registry: TaskRegistry,
    mut commands: mpsc::Receiver<Command>,
    mut progress_rx: ProgressReceiver,
) {
    info!("下载事件循环已启动");

    let shutdown_reply = loop {
        tokio::select! {
            Some(event) = progress_rx.recv() => registry.handle_event(event),
            command = commands.recv() => match command {
                Some(command) => {
                    if let Some(reply) = handle_command(&mut registry, command) {
                        break Some(reply);
                    }
                }
                None => break None,
            },
        }
    };

    let cancelled = registry.cancel_all();
    if cancelled > 0 {
        info!("关闭中，已取消 {} 个活跃任务，等待工作者清理", cancelled);
        let drain = async {
            while registry.active_count() > 0 {
                match progress_rx.recv().await {
                    Some(event) => registry.handle_event(event),
                    None => break,
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("等待工作者清理超时，剩余 {} 个任务", registry.active_count());
        }
    }

    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
    info!("下载事件循环已退出");
}

/// 执行命令；收到关闭命令时返回其回复通道，由循环退出后应答
fn handle_command(registry: &mut TaskRegistry, command: Command) -> Option<oneshot::Sender<()>> {
    // 调用方放弃等待时回复失败，忽略
    match command {
        Command::Submit { request, reply } => {
            let _ = reply.send(registry.submit(request));
        }
        Command::Redownload { identity, reply } => {
            let _ = reply.send(registry.redownload(&identity));
        }
        Command::Delete { identity, reply } => {
            let _ = reply.send(registry.delete_artifact(&identity));
        }
        Command::Cancel { identity, reply } => {
            let _ = reply.send(registry.cancel(&identity));
        }
        Command::Get { identity, reply } => {
            let _ = reply.send(registry.get(&identity));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(registry.snapshot());
        }
        Command::Shutdown { reply } => return Some(reply),
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{AttemptReporter, DownloadJob, ItemMetadata, TaskState};
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// 立即写入文件并上报成功的执行器
    struct InstantExecutor;

    impl DownloadExecutor for InstantExecutor {
        fn start(&self, job: DownloadJob, reporter: AttemptReporter) {
            tokio::spawn(async move {
                reporter.progress(50);
                tokio::fs::write(&job.local_path, b"payload").await.unwrap();
                reporter.succeed(job.local_path);
            });
        }
    }

    /// 只在取消后上报失败的执行器
    struct HangingExecutor;

    impl DownloadExecutor for HangingExecutor {
        fn start(&self, job: DownloadJob, reporter: AttemptReporter) {
            tokio::spawn(async move {
                job.cancel.cancelled().await;
                reporter.fail(crate::downloader::WorkerFailure::cancelled());
            });
        }
    }

    fn manager(
        temp_dir: &TempDir,
        executor: Arc<dyn DownloadExecutor>,
    ) -> (DownloadManager, PathBuf) {
        let download_dir = temp_dir.path().join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();
        let store = RecordStore::load(temp_dir.path().join("downloaded_apps.json"));
        let catalog: HashMap<String, ItemMetadata> = HashMap::new();
        let (manager, _) = DownloadManager::with_executor(
            store,
            executor,
            Arc::new(RwLock::new(download_dir.clone())),
            Arc::new(catalog),
        );
        (manager, download_dir)
    }

    fn request(identity: &str) -> DownloadRequest {
        DownloadRequest::new(identity, "Editor")
            .with_source_url("http://example.invalid/editor.zip")
            .with_format("zip")
    }

    async fn wait_for_completed(rx: &mut broadcast::Receiver<TaskNotification>, identity: &str) {
        loop {
            match rx.recv().await.unwrap() {
                TaskNotification::Completed { identity: id, .. } if id == identity => return,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_submit_completes_through_event_loop() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, download_dir) = manager(&temp_dir, Arc::new(InstantExecutor));
        let mut rx = manager.subscribe();

        let task = manager.submit(request("editor")).await.unwrap();
        assert_eq!(task.state, TaskState::Active);

        tokio::time::timeout(Duration::from_secs(5), wait_for_completed(&mut rx, "editor"))
            .await
            .unwrap();

        let task = manager.get("editor").await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.progress, 100);
        assert!(download_dir.join("Editor.zip").exists());

        manager.delete_artifact("editor").await.unwrap();
        assert!(manager.get("editor").await.unwrap().is_none());
        assert!(!download_dir.join("Editor.zip").exists());
    }

    #[tokio::test]
    async fn test_duplicate_submit_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, _) = manager(&temp_dir, Arc::new(HangingExecutor));

        manager.submit(request("editor")).await.unwrap();
        let err = manager.submit(request("editor")).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyActive(_)));

        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.active.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, _) = manager(&temp_dir, Arc::new(HangingExecutor));

        manager.submit(request("editor")).await.unwrap();
        manager.shutdown().await;

        assert!(matches!(
            manager.snapshot().await,
            Err(RegistryError::ManagerStopped)
        ));
    }
}

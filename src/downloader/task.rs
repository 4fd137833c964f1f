use crate::downloader::ErrorClass;
use crate::filesystem::target_filename;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 下载任务状态
///
/// 没有单独的等待状态：请求被接受后立即启动工作者，以进度 0 的 Active 表示
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// 下载中
    Active,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 应用元数据（用于计算目标文件名）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemMetadata {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// 声明的格式（扩展名）
    #[serde(default)]
    pub format: Option<String>,
}

impl ItemMetadata {
    /// 目标文件名，同一标识多次下载保持不变
    pub fn target_filename(&self) -> String {
        target_filename(&self.name, self.version.as_deref(), self.format.as_deref())
    }
}

/// 下载请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// 稳定标识，缺失时使用名称
    #[serde(default)]
    pub identity: Option<String>,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

impl DownloadRequest {
    pub fn new(identity: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            name: name.into(),
            version: None,
            source_url: None,
            format: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn identity(&self) -> String {
        self.identity
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.name)
            .to_string()
    }

    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            name: self.name.clone(),
            version: self.version.clone(),
            format: self.format.clone(),
        }
    }

    /// 去除空白后的下载链接，空字符串视为缺失
    pub fn source_url(&self) -> Option<&str> {
        self.source_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 应用标识（所有分区中的主键）
    pub identity: String,
    /// 远程地址（可能为空，表示没有下载链接）
    pub source_url: String,
    /// 元数据
    pub metadata: ItemMetadata,
    /// 目标文件名
    pub target_filename: String,
    /// 最近一次尝试解析出的本地路径（仅供展示，文件操作时总是重新解析）
    pub local_path: Option<PathBuf>,
    /// 任务状态
    pub state: TaskState,
    /// 进度百分比 0-100
    pub progress: u8,
    /// 失败分类
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// 失败详情
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// 尝试序号，每次启动工作者递增
    pub attempt: u64,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl DownloadTask {
    /// 创建处于 Active 状态的新任务
    pub fn new(identity: String, source_url: String, metadata: ItemMetadata, attempt: u64) -> Self {
        let target_filename = metadata.target_filename();
        Self {
            identity,
            source_url,
            metadata,
            target_filename,
            local_path: None,
            state: TaskState::Active,
            progress: 0,
            error_class: None,
            error_detail: None,
            attempt,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        }
    }

    /// 重新进入 Active（重新下载）
    pub fn restart(&mut self, attempt: u64) {
        self.state = TaskState::Active;
        self.progress = 0;
        self.error_class = None;
        self.error_detail = None;
        self.completed_at = None;
        self.attempt = attempt;
    }

    /// 更新进度，只接受不小于当前值的百分比
    ///
    /// 返回是否发生变化
    pub fn update_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if self.state != TaskState::Active || percent <= self.progress {
            return false;
        }
        self.progress = percent;
        true
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.state = TaskState::Completed;
        self.progress = 100;
        self.error_class = None;
        self.error_detail = None;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为失败，进度冻结在当前值
    pub fn mark_failed(&mut self, class: ErrorClass, detail: String) {
        self.state = TaskState::Failed;
        self.error_class = Some(class);
        self.error_detail = Some(detail);
    }
}

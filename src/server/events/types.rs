//! 任务通知类型定义

use crate::downloader::ErrorClass;
use serde::{Deserialize, Serialize};

/// 任务变更通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TaskNotification {
    /// 新的下载尝试已启动
    Started {
        identity: String,
        attempt: u64,
        local_path: String,
    },
    /// 进度更新
    Progress { identity: String, percent: u8 },
    /// 下载完成并通过校验
    Completed { identity: String, local_path: String },
    /// 下载失败
    Failed {
        identity: String,
        error_class: ErrorClass,
        /// 简短原因
        summary: String,
        detail: String,
    },
    /// 产物已删除
    Deleted { identity: String },
}

impl TaskNotification {
    pub fn identity(&self) -> &str {
        match self {
            TaskNotification::Started { identity, .. }
            | TaskNotification::Progress { identity, .. }
            | TaskNotification::Completed { identity, .. }
            | TaskNotification::Failed { identity, .. }
            | TaskNotification::Deleted { identity } => identity,
        }
    }

    pub fn failed(identity: &str, error_class: ErrorClass, detail: &str) -> Self {
        TaskNotification::Failed {
            identity: identity.to_string(),
            error_class,
            summary: error_class.summary().to_string(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_serialization() {
        let event = TaskNotification::Progress {
            identity: "editor".to_string(),
            percent: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "progress");
        assert_eq!(json["percent"], 42);

        let failed = TaskNotification::failed("editor", ErrorClass::Timeout, "stalled");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["event_type"], "failed");
        assert_eq!(json["error_class"], "timeout");
        assert_eq!(failed.identity(), "editor");
    }
}

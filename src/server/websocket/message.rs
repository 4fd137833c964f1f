//! WebSocket 消息类型定义

use crate::downloader::RegistrySnapshot;
use crate::server::events::TaskNotification;
use serde::{Deserialize, Serialize};

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// 心跳 Ping
    Ping {
        /// 客户端时间戳（毫秒）
        timestamp: i64,
    },
    /// 请求状态快照
    RequestSnapshot,
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// 连接成功
    Connected { connection_id: String },
    /// 心跳 Pong
    Pong {
        /// 服务端时间戳（毫秒）
        timestamp: i64,
        /// 回显客户端时间戳（用于计算延迟）
        client_timestamp: Option<i64>,
    },
    /// 任务通知
    Event {
        #[serde(flatten)]
        event: TaskNotification,
    },
    /// 推送落后，跳过了部分通知，客户端应重新请求快照
    Lagged { skipped: u64 },
    /// 状态快照
    Snapshot { snapshot: RegistrySnapshot },
    /// 错误
    Error { message: String },
}

impl WsServerMessage {
    pub fn connected(connection_id: String) -> Self {
        Self::Connected { connection_id }
    }

    pub fn pong(client_timestamp: Option<i64>) -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_timestamp,
        }
    }
}

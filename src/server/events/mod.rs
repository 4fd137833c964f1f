//! 事件模块
//!
//! 任务变更通知，经 broadcast 通道发布，由 WebSocket 推送给前端

mod types;

pub use types::*;

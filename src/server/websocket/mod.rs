//! WebSocket 模块
//!
//! 把注册表的任务通知实时推送给前端

mod handler;
mod message;

pub use handler::handle_websocket;
pub use message::{WsClientMessage, WsServerMessage};

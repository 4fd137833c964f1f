//! WebSocket 路由处理器

use crate::server::websocket::message::{WsClientMessage, WsServerMessage};
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket 路由处理器
///
/// 升级 HTTP 连接为 WebSocket，推送任务通知
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 处理 WebSocket 连接
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的 WebSocket 连接: {}", connection_id);

    let mut notifications = state.download_manager.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<WsServerMessage>();
    let (mut sender, mut receiver) = socket.split();

    let connected_msg = WsServerMessage::connected(connection_id.clone());
    if let Ok(json) = serde_json::to_string(&connected_msg) {
        if sender.send(Message::Text(json)).await.is_err() {
            error!("发送连接成功消息失败");
            return;
        }
    }

    // 发送任务：任务通知 + 对客户端请求的回复
    let send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                event = notifications.recv() => match event {
                    Ok(event) => WsServerMessage::Event { event },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket 推送落后，跳过 {} 条通知", skipped);
                        WsServerMessage::Lagged { skipped }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };

            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("序列化消息失败: {}", e),
            }
        }
    });

    let state_recv = state.clone();
    let conn_id_recv = connection_id.clone();

    // 接收任务
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Ping(_) | Message::Pong(_) => {
                    debug!("收到心跳: {}", conn_id_recv);
                    continue;
                }
                Message::Close(_) => {
                    info!("收到关闭消息: {}", conn_id_recv);
                    break;
                }
            };

            let reply = handle_client_message(&state_recv, &text).await;
            if reply_tx.send(reply).is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {
            debug!("发送任务结束: {}", connection_id);
        }
        _ = recv_task => {
            debug!("接收任务结束: {}", connection_id);
        }
    }

    info!("WebSocket 连接已断开: {}", connection_id);
}

/// 处理客户端消息
async fn handle_client_message(state: &AppState, text: &str) -> WsServerMessage {
    match serde_json::from_str::<WsClientMessage>(text) {
        Ok(WsClientMessage::Ping { timestamp }) => WsServerMessage::pong(Some(timestamp)),
        Ok(WsClientMessage::RequestSnapshot) => match state.download_manager.snapshot().await {
            Ok(snapshot) => WsServerMessage::Snapshot { snapshot },
            Err(e) => WsServerMessage::Error {
                message: e.to_string(),
            },
        },
        Err(e) => {
            warn!("无法解析客户端消息: {}, 错误: {}", text, e);
            WsServerMessage::Error {
                message: format!("无效消息: {}", e),
            }
        }
    }
}

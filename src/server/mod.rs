// Web服务器模块

pub mod error;
pub mod events;
pub mod handlers;
pub mod state;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// 健康检查响应
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
    })
}

/// 构建完整路由
pub fn build_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let api_routes = Router::new()
        // 下载任务
        .route(
            "/downloads",
            get(handlers::list_downloads).post(handlers::create_download),
        )
        .route(
            "/downloads/catalog/:identity",
            post(handlers::create_catalog_download),
        )
        .route(
            "/downloads/:identity",
            get(handlers::get_download).delete(handlers::delete_download),
        )
        .route("/downloads/:identity/cancel", post(handlers::cancel_download))
        .route(
            "/downloads/:identity/redownload",
            post(handlers::redownload),
        )
        // 应用目录
        .route("/catalog", get(handlers::list_catalog))
        .route("/catalog/reload", post(handlers::reload_catalog))
        // 配置
        .route(
            "/config/download-dir",
            get(handlers::get_download_dir).put(handlers::update_download_dir),
        )
        .route("/ws", get(websocket::handle_websocket))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}

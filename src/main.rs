use app_store_downloader::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging, server, AppState,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("App Store Downloader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::with_config(config, DEFAULT_CONFIG_PATH)?;
    info!("应用状态初始化完成");

    let app = server::build_router(app_state.clone());

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("WebSocket: ws://{}/api/v1/ws", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    info!("正在取消进行中的下载...");
    app_state.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}

// 应用状态

use crate::catalog::Catalog;
use crate::config::{AppConfig, ConfigHandle};
use crate::downloader::DownloadManager;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 运行期配置
    pub config: ConfigHandle,
    /// 应用目录
    pub catalog: Arc<Catalog>,
    /// 下载管理器
    pub download_manager: DownloadManager,
}

impl AppState {
    /// 加载配置、应用目录，创建下载管理器并完成启动对账
    pub async fn new(config_path: &str) -> Result<Self> {
        let config = AppConfig::load_or_default(config_path).await;
        Self::with_config(config, config_path)
    }

    pub fn with_config(config: AppConfig, config_path: &str) -> Result<Self> {
        config.download.ensure_download_dir_exists()?;

        let handle = ConfigHandle::new(config.clone(), config_path);
        let catalog = Arc::new(Catalog::load_or_empty(config.catalog.catalog_file.clone()));

        let (download_manager, report) =
            DownloadManager::new(&config, Arc::new(handle.clone()), catalog.clone())?;
        info!(
            "启动对账: 已下载 {} 个, 清理失效记录 {} 个",
            report.verified.len(),
            report.dropped.len()
        );

        Ok(Self {
            config: handle,
            catalog,
            download_manager,
        })
    }

    /// 优雅关闭：取消所有下载
    pub async fn shutdown(&self) {
        self.download_manager.shutdown().await;
    }
}

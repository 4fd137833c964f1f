// App Store Downloader Library
// 应用商店下载任务管理核心库

// 应用目录模块
pub mod catalog;

// 配置管理模块
pub mod config;

// 下载任务模块
pub mod downloader;

// 产物文件操作模块
pub mod filesystem;

// 日志模块
pub mod logging;

// 已下载记录持久化模块
pub mod persistence;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use catalog::{Catalog, CatalogItem, CatalogLookup, CatalogSort};
pub use config::{AppConfig, ConfigHandle, DownloadDirProvider};
pub use downloader::{
    DownloadManager, DownloadRequest, DownloadTask, ErrorClass, RegistryError, TaskState,
};
pub use persistence::RecordStore;
pub use server::AppState;

// 配置管理模块

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 分片大小下限 (KB)
pub const MIN_CHUNK_SIZE_KB: u64 = 64;

/// 分片大小上限 (KB)
pub const MAX_CHUNK_SIZE_KB: u64 = 1024;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 应用目录配置
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18888,
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 下载目录（运行期间可修改，每次文件操作时重新读取）
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 写盘分片大小 (KB)
    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 读取停滞超时（秒），超过此时间未收到数据视为超时
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_chunk_size_kb() -> u64 {
    256
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_read_timeout_secs() -> u64 {
    60
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            chunk_size_kb: default_chunk_size_kb(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl DownloadConfig {
    /// 写盘分片大小（字节），限制在 64KB ~ 1MB
    pub fn chunk_size_bytes(&self) -> usize {
        (self.chunk_size_kb.clamp(MIN_CHUNK_SIZE_KB, MAX_CHUNK_SIZE_KB) * 1024) as usize
    }

    /// 确保下载目录存在
    pub fn ensure_download_dir_exists(&self) -> Result<()> {
        if !self.download_dir.exists() {
            std::fs::create_dir_all(&self.download_dir)
                .with_context(|| format!("创建下载目录失败: {:?}", self.download_dir))?;
            info!("✓ 下载目录已创建: {:?}", self.download_dir);
        }
        Ok(())
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 应用数据目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 已下载记录文件名（位于数据目录下）
    #[serde(default = "default_record_file")]
    pub record_file: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("AppData")
}

fn default_record_file() -> String {
    "downloaded_apps.json".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            record_file: default_record_file(),
        }
    }
}

impl PersistenceConfig {
    /// 已下载记录文件完整路径
    pub fn record_path(&self) -> PathBuf {
        self.data_dir.join(&self.record_file)
    }
}

/// 应用目录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// 应用列表文件
    #[serde(default = "default_catalog_file")]
    pub catalog_file: PathBuf,
}

fn default_catalog_file() -> PathBuf {
    PathBuf::from("AppData/apps.json")
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            catalog_file: default_catalog_file(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            download: DownloadConfig::default(),
            persistence: PersistenceConfig::default(),
            catalog: CatalogConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.context("创建配置目录失败")?;
            }
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content).await.context("写入配置文件失败")?;

        info!("配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置并写回文件
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                info!("已加载配置文件: {}", path);
                config
            }
            Err(e) => {
                warn!("加载配置失败，使用默认配置: {:#}", e);
                let config = Self::default();
                if let Err(e) = config.save_to_file(path).await {
                    warn!("写入默认配置失败: {:#}", e);
                }
                config
            }
        }
    }
}

/// 下载目录提供者
///
/// 下载目录是易变的外部设置，任何文件操作都必须在使用时重新读取，不允许缓存
pub trait DownloadDirProvider: Send + Sync {
    fn download_dir(&self) -> PathBuf;
}

/// 运行期共享配置句柄
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<AppConfig>>,
    path: String,
}

impl ConfigHandle {
    pub fn new(config: AppConfig, path: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: path.into(),
        }
    }

    /// 当前配置快照
    pub fn snapshot(&self) -> AppConfig {
        self.inner.read().clone()
    }

    /// 修改下载目录并写回配置文件
    pub async fn set_download_dir(&self, dir: PathBuf) -> Result<()> {
        std::fs::create_dir_all(&dir).with_context(|| format!("创建下载目录失败: {:?}", dir))?;

        let snapshot = {
            let mut guard = self.inner.write();
            guard.download.download_dir = dir.clone();
            guard.clone()
        };
        info!("下载目录已更新: {:?}", dir);

        snapshot.save_to_file(&self.path).await
    }
}

impl DownloadDirProvider for ConfigHandle {
    fn download_dir(&self) -> PathBuf {
        self.inner.read().download.download_dir.clone()
    }
}

impl DownloadDirProvider for RwLock<PathBuf> {
    fn download_dir(&self) -> PathBuf {
        self.read().clone()
    }
}

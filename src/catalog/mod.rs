//! 应用目录
//!
//! 从 apps.json 加载可下载的应用列表，并为启动对账提供 标识 -> 元数据 查询

use crate::downloader::{DownloadRequest, ItemMetadata};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// 目录元数据查询
///
/// 启动对账时用于重新计算已持久化标识的期望文件名
pub trait CatalogLookup: Send + Sync {
    fn lookup(&self, identity: &str) -> Option<ItemMetadata>;

    /// 下载链接，用于重新下载启动时恢复的任务
    fn source_url(&self, _identity: &str) -> Option<String> {
        None
    }

    /// 目录是否加载成功；未加载时查询不到的标识不能视为已下架
    fn is_loaded(&self) -> bool {
        true
    }
}

impl CatalogLookup for HashMap<String, ItemMetadata> {
    fn lookup(&self, identity: &str) -> Option<ItemMetadata> {
        self.get(identity).cloned()
    }
}

/// 目录条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogItem {
    /// 显式标识，缺失时使用名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// 分类（应用 / 游戏）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// 声明的文件格式（扩展名）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CatalogItem {
    /// 稳定标识：优先使用 id，否则回退到名称
    pub fn identity(&self) -> String {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.name)
            .to_string()
    }

    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            name: self.name.clone(),
            version: self.version.clone(),
            format: self.format.clone(),
        }
    }

    /// 关键字需已转为小写
    fn matches_keyword(&self, keyword: &str) -> bool {
        self.name.to_lowercase().contains(keyword)
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(keyword))
    }

    /// 转换为下载请求
    pub fn to_request(&self) -> DownloadRequest {
        DownloadRequest {
            identity: Some(self.identity()),
            name: self.name.clone(),
            version: self.version.clone(),
            source_url: self.download_url.clone(),
            format: self.format.clone(),
        }
    }
}

/// 目录排序方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogSort {
    /// 文件中的原始顺序
    #[default]
    Default,
    /// 按名称
    Name,
}

/// 应用目录（可重新加载）
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    items: RwLock<Vec<CatalogItem>>,
    loaded: AtomicBool,
}

impl Catalog {
    /// 加载目录文件；文件不存在时创建空列表
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let items = read_catalog_file(&path)?;
        info!("已加载应用目录: {:?} ({} 项)", path, items.len());
        Ok(Self {
            path,
            items: RwLock::new(items),
            loaded: AtomicBool::new(true),
        })
    }

    /// 启动时加载：文件损坏时记录错误并以空目录运行，之后可通过 reload 恢复
    pub fn load_or_empty(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(path.clone()) {
            Ok(catalog) => catalog,
            Err(e) => {
                error!("加载应用目录失败，使用空目录: {:#}", e);
                Self {
                    path,
                    items: RwLock::new(Vec::new()),
                    loaded: AtomicBool::new(false),
                }
            }
        }
    }

    /// 直接用条目构建（不关联文件）
    pub fn from_items(items: Vec<CatalogItem>) -> Self {
        Self {
            path: PathBuf::new(),
            items: RwLock::new(items),
            loaded: AtomicBool::new(true),
        }
    }

    /// 重新读取目录文件，返回条目数；失败时保留当前条目
    pub fn reload(&self) -> Result<usize> {
        let items = read_catalog_file(&self.path)?;
        let count = items.len();
        *self.items.write() = items;
        self.loaded.store(true, Ordering::Release);
        info!("应用目录已刷新: {} 项", count);
        Ok(count)
    }

    pub fn items(&self) -> Vec<CatalogItem> {
        self.items.read().clone()
    }

    pub fn find(&self, identity: &str) -> Option<CatalogItem> {
        self.items
            .read()
            .iter()
            .find(|item| item.identity() == identity)
            .cloned()
    }

    /// 按分类和关键字筛选
    ///
    /// 关键字不区分大小写，匹配名称或描述
    pub fn search(
        &self,
        category: Option<&str>,
        keyword: Option<&str>,
        sort: CatalogSort,
    ) -> Vec<CatalogItem> {
        let keyword = keyword
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty());

        let mut items: Vec<CatalogItem> = self
            .items
            .read()
            .iter()
            .filter(|item| match category {
                Some(c) => item.category.as_deref() == Some(c),
                None => true,
            })
            .filter(|item| match &keyword {
                Some(k) => item.matches_keyword(k),
                None => true,
            })
            .cloned()
            .collect();

        if sort == CatalogSort::Name {
            items.sort_by(|a, b| a.name.cmp(&b.name));
        }
        items
    }
}

impl CatalogLookup for Catalog {
    fn lookup(&self, identity: &str) -> Option<ItemMetadata> {
        self.find(identity).map(|item| item.metadata())
    }

    fn source_url(&self, identity: &str) -> Option<String> {
        self.find(identity)?
            .download_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}

fn read_catalog_file(path: &Path) -> Result<Vec<CatalogItem>> {
    if !path.exists() {
        warn!("应用列表文件不存在，创建空列表: {:?}", path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("创建应用目录失败")?;
            }
        }
        std::fs::write(path, "[]").context("创建应用列表文件失败")?;
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("读取应用列表失败: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("解析应用列表失败: {:?}", path))
}

//! 已下载记录存储

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 从文件加载已下载标识集合
///
/// 文件不存在或内容损坏时返回空集合，不影响启动
pub fn load_record_ids(path: &Path) -> BTreeSet<String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("已下载记录文件不存在，使用空集合: {:?}", path);
            return BTreeSet::new();
        }
        Err(e) => {
            warn!("读取已下载记录失败，使用空集合: {:?}, 错误: {}", path, e);
            return BTreeSet::new();
        }
    };

    match serde_json::from_str::<Vec<String>>(&content) {
        Ok(ids) => ids.into_iter().filter(|id| !id.is_empty()).collect(),
        Err(e) => {
            warn!("解析已下载记录失败，使用空集合: {:?}, 错误: {}", path, e);
            BTreeSet::new()
        }
    }
}

/// 整体覆盖写入已下载标识集合
///
/// 先写入临时文件，再原子重命名（防止写入中断导致文件损坏）
pub fn save_record_ids(path: &Path, ids: &BTreeSet<String>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("json.tmp");
    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &ids.iter().collect::<Vec<_>>())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    fs::rename(&temp_path, path)?;
    debug!("已保存已下载记录: {:?} ({} 条)", path, ids.len());
    Ok(())
}

/// 已下载记录的内存镜像
///
/// 仅由任务注册表持有和修改
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    ids: BTreeSet<String>,
}

impl RecordStore {
    /// 从文件加载
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ids = load_record_ids(&path);
        info!("已加载 {} 条已下载记录: {:?}", ids.len(), path);
        Self { path, ids }
    }

    /// 记录文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.ids.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.ids.iter()
    }

    /// 标记为已下载，返回集合是否发生变化
    pub fn insert(&mut self, identity: &str) -> bool {
        self.ids.insert(identity.to_string())
    }

    /// 移除记录，返回集合是否发生变化
    pub fn remove(&mut self, identity: &str) -> bool {
        self.ids.remove(identity)
    }

    /// 只保留满足条件的标识，返回被移除的标识
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&str) -> bool,
    {
        let dropped: Vec<String> = self.ids.iter().filter(|id| !keep(id)).cloned().collect();
        for id in &dropped {
            self.ids.remove(id);
        }
        dropped
    }

    /// 写回磁盘
    pub fn save(&self) -> io::Result<()> {
        save_record_ids(&self.path, &self.ids)
    }
}

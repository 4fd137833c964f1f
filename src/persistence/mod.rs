//! 持久化模块
//!
//! 已下载记录：一个 JSON 数组，保存所有"已验证下载完成"的应用标识
//!
//! ## 文件结构
//!
//! ```text
//! AppData/
//! └── downloaded_apps.json    # ["app-a", "app-b", ...]
//! ```
//!
//! 每次变更后整体重写（先写临时文件再原子重命名），不做增量追加

pub mod record_store;

pub use record_store::{load_record_ids, save_record_ids, RecordStore};

// 本地文件操作模块
//
// 产物文件命名、路径解析与删除。注册表、启动对账和外部调用方共用同一套规则

mod artifact;

pub use artifact::{
    artifact_exists, delete_artifact, remove_partial_file, resolve_local_path, sanitize_component,
    target_filename,
};

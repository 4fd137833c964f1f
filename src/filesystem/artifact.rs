//! 下载产物文件操作
//!
//! 文件名规则是固定契约：启动对账需要在之后重新计算出完全相同的文件名
//!
//! ```text
//! name_version.format   版本和格式都存在
//! name.format           无版本
//! name_version          无格式
//! ```

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 文件名中不允许出现的字符
const FORBIDDEN_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// 清理文件名片段：替换路径分隔符和非法字符，去掉首尾空白
pub fn sanitize_component(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if FORBIDDEN_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// 根据名称、版本和格式生成目标文件名
pub fn target_filename(name: &str, version: Option<&str>, format: Option<&str>) -> String {
    let mut filename = sanitize_component(name);

    if let Some(version) = version.map(str::trim).filter(|v| !v.is_empty()) {
        filename.push('_');
        filename.push_str(&sanitize_component(version));
    }

    if let Some(ext) = format
        .map(|f| f.trim().trim_start_matches('.'))
        .filter(|f| !f.is_empty())
    {
        filename.push('.');
        filename.push_str(&sanitize_component(ext));
    }

    filename
}

/// 解析本地路径：下载目录 + 目标文件名
///
/// 调用方必须传入当次读取到的下载目录
pub fn resolve_local_path(download_dir: &Path, filename: &str) -> PathBuf {
    download_dir.join(filename)
}

/// 产物是否存在于磁盘
pub fn artifact_exists(path: &Path) -> bool {
    path.is_file()
}

/// 删除产物文件
///
/// 文件本就不存在视为成功，返回 `Ok(false)`；真正删除返回 `Ok(true)`
pub fn delete_artifact(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("已删除产物文件: {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("产物文件已不存在: {:?}", path);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// 尽力删除未完成的文件，失败只记录日志
pub async fn remove_partial_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("已删除未完成文件: {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除未完成文件失败: {:?}, 错误: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_target_filename_rules() {
        assert_eq!(
            target_filename("Editor", Some("1.2.0"), Some("zip")),
            "Editor_1.2.0.zip"
        );
        assert_eq!(target_filename("Editor", None, Some(".exe")), "Editor.exe");
        assert_eq!(target_filename("Editor", Some("  "), Some("exe")), "Editor.exe");
        assert_eq!(target_filename("Editor", Some("2"), None), "Editor_2");
    }

    #[test]
    fn test_target_filename_is_stable() {
        let first = target_filename("Media Player", Some("3.0"), Some("msi"));
        let second = target_filename("Media Player", Some("3.0"), Some("msi"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_sanitize_strips_path_separators() {
        assert_eq!(sanitize_component("../evil/name"), ".._evil_name");
        assert_eq!(target_filename("a\\b", Some("1:0"), Some("zip")), "a_b_1_0.zip");
    }

    #[test]
    fn test_delete_artifact_tolerates_missing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app_1.0.zip");

        assert!(!delete_artifact(&path).unwrap());

        std::fs::write(&path, b"data").unwrap();
        assert!(artifact_exists(&path));
        assert!(delete_artifact(&path).unwrap());
        assert!(!artifact_exists(&path));
    }

    #[test]
    fn test_delete_artifact_reports_real_failures() {
        let temp_dir = TempDir::new().unwrap();
        // 目录不能用 remove_file 删除
        let dir = temp_dir.path().join("app_1.0.zip");
        std::fs::create_dir(&dir).unwrap();

        assert!(delete_artifact(&dir).is_err());
    }
}

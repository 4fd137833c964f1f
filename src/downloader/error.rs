//! 下载错误分类
//!
//! 分类依据故障本身的性质（reqwest 错误标志、rustls 错误类型、io::ErrorKind），不匹配错误消息文本

use crate::downloader::TaskState;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 失败分类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// 请求缺少下载链接
    NoDownloadLink,
    /// 连接被拒绝/重置、DNS 失败
    Network,
    /// 超时
    Timeout,
    /// TLS / 证书错误
    Tls,
    /// 非成功的 HTTP 状态码
    HttpStatus,
    /// 无法创建目录、打开、写入或删除文件
    Filesystem,
    /// 用户取消
    Cancelled,
    /// 未知错误
    Unknown,
}

impl ErrorClass {
    /// 展示给用户的简短原因
    pub fn summary(&self) -> &'static str {
        match self {
            ErrorClass::NoDownloadLink => "没有可用的下载链接",
            ErrorClass::Network => "网络连接失败",
            ErrorClass::Timeout => "连接超时",
            ErrorClass::Tls => "安全连接失败",
            ErrorClass::HttpStatus => "服务器返回错误",
            ErrorClass::Filesystem => "文件写入失败",
            ErrorClass::Cancelled => "已取消",
            ErrorClass::Unknown => "未知错误",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.summary())
    }
}

/// 单次下载尝试的失败结果
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{class}: {detail}")]
pub struct WorkerFailure {
    pub class: ErrorClass,
    pub detail: String,
}

impl WorkerFailure {
    pub fn new(class: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorClass::Cancelled, "cancelled by user")
    }

    /// 文件系统错误，附带操作描述
    pub fn filesystem(action: &str, err: &io::Error) -> Self {
        Self::new(ErrorClass::Filesystem, format!("{}: {}", action, err))
    }
}

impl From<reqwest::Error> for WorkerFailure {
    fn from(err: reqwest::Error) -> Self {
        let class = classify_reqwest_error(&err);
        Self::new(class, format_error_chain(&err))
    }
}

impl From<io::Error> for WorkerFailure {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorClass::Filesystem, err.to_string())
    }
}

/// 根据 reqwest 错误的性质分类
pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        return ErrorClass::Timeout;
    }
    if err.is_status() {
        return ErrorClass::HttpStatus;
    }

    if is_tls_error(err) {
        return ErrorClass::Tls;
    }
    if find_io_error_kind(err) == Some(io::ErrorKind::TimedOut) {
        return ErrorClass::Timeout;
    }

    if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() || err.is_redirect()
    {
        return ErrorClass::Network;
    }

    ErrorClass::Unknown
}

/// 沿 source 链查找第一个 io::Error 的类型
pub fn find_io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = e.source();
    }
    None
}

/// 错误链中是否包含 rustls 错误
///
/// 握手失败被包装在 io::Error 中，而 io::Error::source() 会跳过被包装的错误本身，
/// 所以需要通过 get_ref() 进入内层
pub fn is_tls_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if e.is::<rustls::Error>() {
            return true;
        }
        if let Some(inner) = e.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
            if is_tls_error(inner) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// 拼接完整错误链，用于日志和失败详情
pub fn format_error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        current = e.source();
    }
    parts.join(": ")
}

/// 注册表拒绝命令的原因
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("任务已在下载中: {0}")]
    AlreadyActive(String),

    #[error("任务不存在: {0}")]
    NotFound(String),

    #[error("任务 {identity} 处于 {state} 状态，不能执行 {operation}")]
    InvalidTransition {
        identity: String,
        state: TaskState,
        operation: &'static str,
    },

    #[error("删除产物文件失败: {path:?}")]
    DeleteFailed {
        identity: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("下载管理器已停止")]
    ManagerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapper(io::Error);

    impl std::fmt::Display for Wrapper {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "wrapped")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_find_io_error_kind_walks_chain() {
        let err = Wrapper(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(find_io_error_kind(&err), Some(io::ErrorKind::TimedOut));
        assert_eq!(format_error_chain(&err), "wrapped: slow");
    }

    #[test]
    fn test_rustls_error_inside_io_error_is_tls() {
        let io_err = io::Error::new(
            io::ErrorKind::Other,
            rustls::Error::General("handshake failed".to_string()),
        );
        let err = Wrapper(io_err);
        assert!(is_tls_error(&err));

        let plain = Wrapper(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(!is_tls_error(&plain));
    }

    #[test]
    fn test_io_error_is_filesystem() {
        let failure: WorkerFailure = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(failure.class, ErrorClass::Filesystem);
    }

    #[test]
    fn test_error_class_serialization() {
        let json = serde_json::to_string(&ErrorClass::NoDownloadLink).unwrap();
        assert_eq!(json, "\"no_download_link\"");
        assert_eq!(WorkerFailure::cancelled().class, ErrorClass::Cancelled);
    }

    #[tokio::test]
    async fn test_connection_refused_is_network() {
        // 绑定后立即释放端口，连接将被拒绝
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = reqwest::get(format!("http://{}/file", addr)).await.unwrap_err();
        assert_eq!(classify_reqwest_error(&err), ErrorClass::Network);
    }

    #[tokio::test]
    async fn test_https_to_plain_http_server_is_tls() {
        // 对端只说明文 HTTP，握手收到的记录类型非法
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route("/file", axum::routing::get(|| async { "plain" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let err = reqwest::get(format!("https://{}/file", addr)).await.unwrap_err();
        assert_eq!(classify_reqwest_error(&err), ErrorClass::Tls);
        assert_eq!(WorkerFailure::from(err).class, ErrorClass::Tls);
    }

    #[tokio::test]
    async fn test_status_error_is_http_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/missing",
            axum::routing::get(|| async { axum::http::StatusCode::NOT_FOUND }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let resp = reqwest::get(format!("http://{}/missing", addr)).await.unwrap();
        let err = resp.error_for_status().unwrap_err();
        assert_eq!(classify_reqwest_error(&err), ErrorClass::HttpStatus);
    }
}

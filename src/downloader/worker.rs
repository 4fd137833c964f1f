//! 下载工作者
//!
//! 执行一次下载尝试：流式 GET，按固定大小分片写入本地文件，计算进度，
//! 在分片写入之间检查取消信号，并把失败归类后作为终止事件上报。
//! 工作者不接触注册表的任何数据，只通过进度通道通信

use crate::config::DownloadConfig;
use crate::downloader::{AttemptReporter, ErrorClass, WorkerFailure};
use crate::filesystem::remove_partial_file;
use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 一次下载尝试的参数
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub identity: String,
    pub attempt: u64,
    pub source_url: String,
    /// 本次尝试解析出的本地路径
    pub local_path: PathBuf,
    pub cancel: CancellationToken,
}

/// 下载执行器
///
/// 注册表通过它启动工作者；每次调用必须最终通过 reporter 上报恰好一个终止事件
pub trait DownloadExecutor: Send + Sync {
    fn start(&self, job: DownloadJob, reporter: AttemptReporter);
}

/// 工作者参数
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// 写盘分片大小（字节）
    pub chunk_size: usize,
    /// 读取停滞超时
    pub read_timeout: Duration,
}

impl WorkerOptions {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size_bytes(),
            read_timeout: Duration::from_secs(config.read_timeout_secs.max(1)),
        }
    }
}

/// 基于 reqwest 的 HTTP 下载工作者
#[derive(Debug, Clone)]
pub struct DownloadWorker {
    client: Client,
    options: WorkerOptions,
}

impl DownloadWorker {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .user_agent(concat!("app-store-downloader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self::with_client(client, WorkerOptions::from_config(config)))
    }

    pub fn with_client(client: Client, options: WorkerOptions) -> Self {
        Self { client, options }
    }

    /// 执行一次下载尝试并上报终止事件
    pub async fn run(&self, job: DownloadJob, reporter: AttemptReporter) {
        info!(
            "开始下载: {} (attempt={}) {} -> {:?}",
            job.identity, job.attempt, job.source_url, job.local_path
        );

        match self.execute(&job, &reporter).await {
            Ok(bytes) => {
                info!("下载完成: {} ({} bytes)", job.identity, bytes);
                reporter.succeed(job.local_path);
            }
            Err(failure) => {
                remove_partial_file(&job.local_path).await;
                if failure.class == ErrorClass::Cancelled {
                    info!("下载已取消: {}", job.identity);
                } else {
                    warn!(
                        "下载失败: {} class={:?} detail={}",
                        job.identity, failure.class, failure.detail
                    );
                }
                reporter.fail(failure);
            }
        }
    }

    async fn execute(
        &self,
        job: &DownloadJob,
        reporter: &AttemptReporter,
    ) -> Result<u64, WorkerFailure> {
        if job.cancel.is_cancelled() {
            return Err(WorkerFailure::cancelled());
        }

        // 预清理：删除旧产物，失败时直接覆盖写入
        match tokio::fs::remove_file(&job.local_path).await {
            Ok(()) => debug!("已删除旧文件: {:?}", job.local_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除旧文件失败，将直接覆盖: {:?}, 错误: {}", job.local_path, e),
        }

        if let Some(parent) = job.local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkerFailure::filesystem("创建下载目录失败", &e))?;
        }

        let response = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => return Err(WorkerFailure::cancelled()),
            resp = self.client.get(&job.source_url).send() => resp?,
        };
        let response = response.error_for_status()?;

        // 大小未知或为 0 时不上报中间进度
        let total_size = response.content_length().filter(|&len| len > 0);
        debug!("{} 响应大小: {:?}", job.identity, total_size);

        let mut file = File::create(&job.local_path)
            .await
            .map_err(|e| WorkerFailure::filesystem("创建文件失败", &e))?;

        let chunk_size = self.options.chunk_size.max(1);
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut written = 0u64;
        let mut last_percent = 0u8;

        loop {
            let next = tokio::select! {
                biased;
                _ = job.cancel.cancelled() => return Err(WorkerFailure::cancelled()),
                next = tokio::time::timeout(self.options.read_timeout, stream.next()) => next,
            };

            let bytes = match next {
                Err(_) => {
                    return Err(WorkerFailure::new(
                        ErrorClass::Timeout,
                        format!("{} 秒内未收到数据", self.options.read_timeout.as_secs_f32()),
                    ))
                }
                Ok(None) => break,
                Ok(Some(item)) => item?,
            };
            buffer.extend_from_slice(&bytes);

            while buffer.len() >= chunk_size {
                let rest = buffer.split_off(chunk_size);
                written += write_chunk(&mut file, &buffer).await?;
                buffer = rest;
                report_progress(reporter, written, total_size, &mut last_percent);

                // 分片之间检查取消
                if job.cancel.is_cancelled() {
                    return Err(WorkerFailure::cancelled());
                }
            }
        }

        if !buffer.is_empty() {
            written += write_chunk(&mut file, &buffer).await?;
            report_progress(reporter, written, total_size, &mut last_percent);
        }

        file.flush()
            .await
            .map_err(|e| WorkerFailure::filesystem("刷新文件缓冲失败", &e))?;
        file.sync_all()
            .await
            .map_err(|e| WorkerFailure::filesystem("同步文件失败", &e))?;

        if let Some(total) = total_size {
            if written < total {
                return Err(WorkerFailure::new(
                    ErrorClass::Network,
                    format!("连接提前关闭: 已接收 {} / {} bytes", written, total),
                ));
            }
        }

        Ok(written)
    }
}

impl DownloadExecutor for DownloadWorker {
    fn start(&self, job: DownloadJob, reporter: AttemptReporter) {
        let worker = self.clone();
        tokio::spawn(async move {
            worker.run(job, reporter).await;
        });
    }
}

async fn write_chunk(file: &mut File, data: &[u8]) -> Result<u64, WorkerFailure> {
    file.write_all(data)
        .await
        .map_err(|e| WorkerFailure::filesystem("写入文件失败", &e))?;
    Ok(data.len() as u64)
}

/// 百分比向下取整，超过总大小时封顶 100
fn percent_of(written: u64, total: u64) -> u8 {
    ((written.saturating_mul(100)) / total).min(100) as u8
}

fn report_progress(
    reporter: &AttemptReporter,
    written: u64,
    total_size: Option<u64>,
    last_percent: &mut u8,
) {
    let Some(total) = total_size else {
        return;
    };
    let percent = percent_of(written, total);
    if percent > *last_percent {
        *last_percent = percent;
        reporter.progress(percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{progress_channel, ProgressReceiver, WorkerEvent};
    use axum::body::{Body, Bytes};
    use axum::http::{header, StatusCode};
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    const BODY_SIZE: usize = 1024 * 1024;

    async fn spawn_server() -> SocketAddr {
        let app = Router::new()
            .route("/sized", get(|| async { vec![42u8; BODY_SIZE] }))
            .route(
                "/unsized",
                get(|| async {
                    let chunks = futures::stream::iter(
                        (0..8).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![1u8; 10_000]))),
                    );
                    Body::from_stream(chunks)
                }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/slow",
                get(|| async {
                    let total = 200 * 64 * 1024;
                    let chunks = futures::stream::unfold(0usize, |n| async move {
                        if n >= 200 {
                            return None;
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Some((Ok::<_, std::io::Error>(Bytes::from(vec![9u8; 64 * 1024])), n + 1))
                    });
                    Response::builder()
                        .header(header::CONTENT_LENGTH, total)
                        .body(Body::from_stream(chunks))
                        .unwrap()
                }),
            )
            .route(
                "/stall",
                get(|| async {
                    let chunks = futures::stream::unfold(0usize, |n| async move {
                        if n > 0 {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                        Some((Ok::<_, std::io::Error>(Bytes::from(vec![5u8; 1024])), n + 1))
                    });
                    Body::from_stream(chunks)
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn test_worker(chunk_size: usize, read_timeout: Duration) -> DownloadWorker {
        DownloadWorker::with_client(
            Client::new(),
            WorkerOptions {
                chunk_size,
                read_timeout,
            },
        )
    }

    fn job(addr: SocketAddr, route: &str, path: PathBuf) -> DownloadJob {
        DownloadJob {
            identity: "app".to_string(),
            attempt: 1,
            source_url: format!("http://{}{}", addr, route),
            local_path: path,
            cancel: CancellationToken::new(),
        }
    }

    fn drain(rx: &mut ProgressReceiver) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_known_size_reports_monotonic_progress() {
        let addr = spawn_server().await;
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app_1.0.zip");
        let (tx, mut rx) = progress_channel();

        test_worker(64 * 1024, Duration::from_secs(5))
            .run(job(addr, "/sized", path.clone()), tx.reporter("app", 1))
            .await;

        let events = drain(&mut rx);
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();

        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*percents.last().unwrap(), 100);
        assert!(matches!(events.last(), Some(WorkerEvent::Success { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(std::fs::read(&path).unwrap().len(), BODY_SIZE);
    }

    #[tokio::test]
    async fn test_unknown_size_has_no_intermediate_progress() {
        let addr = spawn_server().await;
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.bin");
        let (tx, mut rx) = progress_channel();

        test_worker(64 * 1024, Duration::from_secs(5))
            .run(job(addr, "/unsized", path.clone()), tx.reporter("app", 1))
            .await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], WorkerEvent::Success { .. }));
        assert_eq!(std::fs::read(&path).unwrap().len(), 80_000);
    }

    #[tokio::test]
    async fn test_http_status_failure() {
        let addr = spawn_server().await;
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.bin");
        let (tx, mut rx) = progress_channel();

        test_worker(64 * 1024, Duration::from_secs(5))
            .run(job(addr, "/missing", path.clone()), tx.reporter("app", 1))
            .await;

        match drain(&mut rx).as_slice() {
            [WorkerEvent::Failure { failure, .. }] => {
                assert_eq!(failure.class, ErrorClass::HttpStatus)
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_artifact_is_replaced() {
        let addr = spawn_server().await;
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.bin");
        std::fs::write(&path, b"stale content that is longer than nothing").unwrap();
        let (tx, _rx) = progress_channel();

        test_worker(64 * 1024, Duration::from_secs(5))
            .run(job(addr, "/unsized", path.clone()), tx.reporter("app", 1))
            .await;

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 80_000);
        assert!(data.iter().all(|&b| b == 1));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_removes_partial_file() {
        let addr = spawn_server().await;
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.bin");
        let (tx, mut rx) = progress_channel();

        let job = job(addr, "/slow", path.clone());
        let cancel = job.cancel.clone();
        let worker = test_worker(64 * 1024, Duration::from_secs(5));
        worker.start(job, tx.reporter("app", 1));

        // 收到第一条进度后取消
        match rx.recv().await.unwrap() {
            WorkerEvent::Progress { .. } => cancel.cancel(),
            other => panic!("unexpected event: {:?}", other),
        }

        let terminal = loop {
            let event = rx.recv().await.unwrap();
            if event.is_terminal() {
                break event;
            }
        };
        match terminal {
            WorkerEvent::Failure { failure, .. } => {
                assert_eq!(failure.class, ErrorClass::Cancelled);
                assert_eq!(failure.detail, "cancelled by user");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.bin");
        let (tx, mut rx) = progress_channel();

        let job = DownloadJob {
            identity: "app".to_string(),
            attempt: 1,
            source_url: "http://127.0.0.1:9/never".to_string(),
            local_path: path.clone(),
            cancel: CancellationToken::new(),
        };
        job.cancel.cancel();

        test_worker(64 * 1024, Duration::from_secs(5))
            .run(job, tx.reporter("app", 1))
            .await;

        match drain(&mut rx).as_slice() {
            [WorkerEvent::Failure { failure, .. }] => {
                assert_eq!(failure.class, ErrorClass::Cancelled)
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_read_stall_is_timeout() {
        let addr = spawn_server().await;
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.bin");
        let (tx, mut rx) = progress_channel();

        test_worker(64 * 1024, Duration::from_millis(200))
            .run(job(addr, "/stall", path.clone()), tx.reporter("app", 1))
            .await;

        match drain(&mut rx).as_slice() {
            [WorkerEvent::Failure { failure, .. }] => assert_eq!(failure.class, ErrorClass::Timeout),
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(0, 1000), 0);
        assert_eq!(percent_of(999, 1000), 99);
        assert_eq!(percent_of(1000, 1000), 100);
        assert_eq!(percent_of(5000, 1000), 100);
    }
}

//! 进度通道
//!
//! 多生产者（每个下载工作者一个）/ 单消费者（注册表事件循环）的无界有序队列。
//! 同一工作者发出的事件按发送顺序到达；不同标识之间不保证顺序；通道从不丢弃事件

use crate::downloader::{ErrorClass, WorkerFailure};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 工作者发往注册表的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// 中间进度
    Progress {
        identity: String,
        attempt: u64,
        percent: u8,
    },
    /// 下载成功
    Success {
        identity: String,
        attempt: u64,
        local_path: PathBuf,
    },
    /// 下载失败（含取消）
    Failure {
        identity: String,
        attempt: u64,
        failure: WorkerFailure,
    },
}

impl WorkerEvent {
    pub fn identity(&self) -> &str {
        match self {
            WorkerEvent::Progress { identity, .. } => identity,
            WorkerEvent::Success { identity, .. } => identity,
            WorkerEvent::Failure { identity, .. } => identity,
        }
    }

    pub fn attempt(&self) -> u64 {
        match self {
            WorkerEvent::Progress { attempt, .. } => *attempt,
            WorkerEvent::Success { attempt, .. } => *attempt,
            WorkerEvent::Failure { attempt, .. } => *attempt,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerEvent::Progress { .. })
    }
}

/// 创建进度通道
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressReceiver { rx })
}

/// 发送端，可克隆给任意数量的工作者
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ProgressSender {
    /// 发送事件；消费者已退出时返回 false
    pub fn send(&self, event: WorkerEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("进度通道已关闭，丢弃事件: {:?}", e.0);
                false
            }
        }
    }

    /// 绑定到某一次下载尝试的上报器
    pub fn reporter(&self, identity: impl Into<String>, attempt: u64) -> AttemptReporter {
        AttemptReporter {
            identity: identity.into(),
            attempt,
            sender: self.clone(),
            finished: false,
        }
    }
}

/// 接收端，只能有一个消费者
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl ProgressReceiver {
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WorkerEvent> {
        self.rx.try_recv().ok()
    }
}

/// 单次下载尝试的事件上报器
///
/// 终止事件的方法按值消费 self，保证每次尝试恰好一个终止事件；
/// 未上报终止事件就被丢弃（工作者 panic 或任务被中止）时补发 Unknown 失败
#[derive(Debug)]
pub struct AttemptReporter {
    identity: String,
    attempt: u64,
    sender: ProgressSender,
    finished: bool,
}

impl AttemptReporter {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn progress(&self, percent: u8) {
        self.sender.send(WorkerEvent::Progress {
            identity: self.identity.clone(),
            attempt: self.attempt,
            percent,
        });
    }

    pub fn succeed(mut self, local_path: PathBuf) {
        self.finish(|identity, attempt| WorkerEvent::Success {
            identity,
            attempt,
            local_path,
        });
    }

    pub fn fail(mut self, failure: WorkerFailure) {
        self.finish(|identity, attempt| WorkerEvent::Failure {
            identity,
            attempt,
            failure,
        });
    }

    fn finish(&mut self, build: impl FnOnce(String, u64) -> WorkerEvent) {
        self.finished = true;
        let event = build(std::mem::take(&mut self.identity), self.attempt);
        self.sender.send(event);
    }
}

impl Drop for AttemptReporter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            "下载尝试未上报结果即结束: {} (attempt={})",
            self.identity, self.attempt
        );
        self.finish(|identity, attempt| WorkerEvent::Failure {
            identity,
            attempt,
            failure: WorkerFailure::new(ErrorClass::Unknown, "worker exited without a result"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_per_producer_order_is_preserved() {
        let (tx, mut rx) = progress_channel();

        let mut handles = Vec::new();
        for n in 0..4 {
            let reporter = tx.reporter(format!("app-{}", n), 1);
            handles.push(tokio::spawn(async move {
                for pct in 0..=100u8 {
                    reporter.progress(pct);
                    tokio::task::yield_now().await;
                }
                reporter.succeed(PathBuf::from("/tmp/x"));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(tx);

        let mut last: std::collections::HashMap<String, i32> = Default::default();
        let mut terminals = 0;
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Progress {
                    identity, percent, ..
                } => {
                    let prev = last.entry(identity).or_insert(-1);
                    assert!(percent as i32 > *prev);
                    *prev = percent as i32;
                }
                WorkerEvent::Success { identity, .. } => {
                    assert_eq!(last[&identity], 100);
                    terminals += 1;
                }
                WorkerEvent::Failure { .. } => unreachable!(),
            }
        }
        assert_eq!(terminals, 4);
    }

    #[test]
    fn test_send_after_consumer_dropped() {
        let (tx, rx) = progress_channel();
        drop(rx);
        let reporter = tx.reporter("app", 3);
        assert_eq!(reporter.attempt(), 3);
        // 不应 panic
        reporter.fail(WorkerFailure::new(ErrorClass::Unknown, "x"));
    }

    #[test]
    fn test_dropped_reporter_sends_one_failure() {
        let (tx, mut rx) = progress_channel();

        let reporter = tx.reporter("app", 2);
        reporter.progress(30);
        drop(reporter);
        tx.reporter("done", 1).succeed(PathBuf::from("/tmp/done"));

        assert!(matches!(rx.try_recv(), Some(WorkerEvent::Progress { percent: 30, .. })));
        match rx.try_recv() {
            Some(WorkerEvent::Failure {
                identity,
                attempt,
                failure,
            }) => {
                assert_eq!(identity, "app");
                assert_eq!(attempt, 2);
                assert_eq!(failure.class, ErrorClass::Unknown);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.try_recv(), Some(WorkerEvent::Success { .. })));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_panicking_worker_still_reports_failure() {
        let (tx, mut rx) = progress_channel();
        let reporter = tx.reporter("app", 1);

        let handle = tokio::spawn(async move {
            reporter.progress(10);
            panic!("worker crashed");
        });
        assert!(handle.await.is_err());

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Progress { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::Failure { failure, .. }) if failure.class == ErrorClass::Unknown
        ));
    }

    #[test]
    fn test_event_accessors() {
        let event = WorkerEvent::Failure {
            identity: "a".to_string(),
            attempt: 7,
            failure: WorkerFailure::cancelled(),
        };
        assert_eq!(event.identity(), "a");
        assert_eq!(event.attempt(), 7);
        assert!(event.is_terminal());
    }
}

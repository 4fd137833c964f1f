//! 下载模块
//!
//! - `task`: 任务数据模型
//! - `error`: 失败分类与注册表错误
//! - `channel`: 工作者到注册表的进度通道
//! - `worker`: 单次下载尝试
//! - `registry`: 任务状态机
//! - `manager`: 异步句柄与事件循环

pub mod channel;
pub mod error;
pub mod manager;
pub mod registry;
pub mod task;
pub mod worker;

pub use channel::{progress_channel, AttemptReporter, ProgressReceiver, ProgressSender, WorkerEvent};
pub use error::{classify_reqwest_error, ErrorClass, RegistryError, WorkerFailure};
pub use manager::DownloadManager;
pub use registry::{ReconcileReport, RegistrySnapshot, TaskRegistry};
pub use task::{DownloadRequest, DownloadTask, ItemMetadata, TaskState};
pub use worker::{DownloadExecutor, DownloadJob, DownloadWorker, WorkerOptions};

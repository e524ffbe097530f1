//! 工作者模块
//!
//! 包含单个端点的检测流水线和并发执行任务的工作者池

pub mod pipeline;
pub mod pool;

pub use pipeline::{CheckPipeline, PipelineOptions, PipelineOutcome};
pub use pool::{WorkerPool, WorkerPoolStatus};

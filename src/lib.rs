//! Relay Vitals - 中继服务器健康监控工具
//!
//! 对注册的消息中继服务器进行周期性检测，支持：
//! - 通过测试服务的WebSocket接口进行可达性测试
//! - 基于GeoIP的国家解析
//! - 信息页面探测（可选Tor代理）
//! - cron全量重扫与新端点即时检测
//! - 基于SQLite的持久化任务队列与并发工作者

pub mod cli;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod probe;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod worker;

// 重新导出主要类型
pub use config::{Config, GlobalConfig};
pub use endpoint::{classify, CheckOutcome, EndpointRecord, EndpointState, ParsedUri};
pub use error::RelayVitalsError;
pub use queue::WorkQueue;
pub use scheduler::{RescanScheduler, Scheduler};
pub use store::StatusStore;
pub use worker::{CheckPipeline, WorkerPool};

/// 应用程序版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 应用程序名称
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// 应用程序描述
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

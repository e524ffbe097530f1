//! 端点模块
//!
//! 提供中继服务器URI解析和端点状态记录

pub mod record;
pub mod uri;

// 重新导出主要类型
pub use record::{CheckOutcome, EndpointRecord, EndpointState, StatusUpdate, Transition, UpdateOutcome};
pub use uri::{classify, is_official, is_onion, ParsedUri, ServerProtocol};

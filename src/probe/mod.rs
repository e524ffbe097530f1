//! 探测模块
//!
//! 提供中继服务器可达性测试、信息页面检测和地理位置解析功能

pub mod geo;
pub mod info_page;
pub mod reachability;

// 重新导出主要类型
pub use geo::{CountryLookup, CountryResolver, GeoResolver, HostResolver, MaxMindLookup, SystemResolver};
pub use info_page::{HttpInfoPageProber, InfoPageProber};
pub use reachability::{CommandFrame, PendingRequests, ReachabilityProber, TestResult, WsReachabilityProber};

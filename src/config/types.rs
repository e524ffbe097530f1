//! 配置数据结构定义
//!
//! 定义应用程序的配置结构体和验证逻辑，所有配置节均可省略并使用默认值

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// 全局配置项
    #[serde(default)]
    pub global: GlobalConfig,
    /// 状态存储配置
    #[serde(default)]
    pub store: StoreConfig,
    /// 任务队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 调度器配置
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// 工作者配置
    #[serde(default)]
    pub worker: WorkerConfig,
    /// 探测配置
    #[serde(default)]
    pub probe: ProbeConfig,
    /// GeoIP数据库配置
    #[serde(default)]
    pub geoip: GeoIpConfig,
}

/// 全局配置结构
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 只运行探测，不修改状态存储
    #[serde(default)]
    pub dry_run: bool,
}

/// 状态存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// SQLite数据库文件路径
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// 注册事件轮询间隔（毫秒）
    #[serde(default = "default_registration_poll_ms")]
    pub registration_poll_ms: u64,
}

/// 任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// 队列名
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// SQLite数据库文件路径
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// 单个任务的最大投递次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 首次重试等待（秒），之后逐次翻倍
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
    /// 执行租约（秒）
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// 空闲轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// 是否启用
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 全量重扫的cron表达式，五段式表达式会补上秒字段
    #[serde(default = "default_cron")]
    pub cron: String,
}

/// 工作者配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// 是否启用
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 并发执行的任务数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

/// 探测配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// 测试代理的WebSocket地址
    #[serde(default = "default_harness_ws_url")]
    pub harness_ws_url: String,
    /// 可达性测试超时（秒）
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout_seconds: u64,
    /// 可达性测试尝试次数
    #[serde(default = "default_reachability_attempts")]
    pub reachability_attempts: u32,
    /// 信息页面请求超时（秒）
    #[serde(default = "default_info_page_timeout")]
    pub info_page_timeout_seconds: u64,
    /// 信息页面标识字符串
    #[serde(default = "default_info_page_marker")]
    pub info_page_marker: String,
    /// 官方端点的域名标识
    #[serde(default = "default_official_domain_marker")]
    pub official_domain_marker: String,
    /// Tor SOCKS5代理地址，用于onion域名的信息页面
    #[serde(default)]
    pub tor_socks5_proxy: Option<String>,
}

/// GeoIP数据库配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeoIpConfig {
    /// MaxMind国家数据库路径，未配置时跳过国家解析
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dry_run: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            registration_poll_ms: default_registration_poll_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            database_path: default_database_path(),
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
            lease_seconds: default_lease_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            cron: default_cron(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            concurrency: default_concurrency(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            harness_ws_url: default_harness_ws_url(),
            reachability_timeout_seconds: default_reachability_timeout(),
            reachability_attempts: default_reachability_attempts(),
            info_page_timeout_seconds: default_info_page_timeout(),
            info_page_marker: default_info_page_marker(),
            official_domain_marker: default_official_domain_marker(),
            tor_socks5_proxy: None,
        }
    }
}

// 默认值函数
fn default_log_level() -> String {
    "info".to_string()
}
fn default_database_path() -> PathBuf {
    PathBuf::from("relay-vitals.db")
}
fn default_registration_poll_ms() -> u64 {
    1000
}
fn default_queue_name() -> String {
    "relay-checks".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_seconds() -> u64 {
    5
}
fn default_lease_seconds() -> u64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_enabled() -> bool {
    true
}
fn default_cron() -> String {
    "0 */30 * * * *".to_string()
}
fn default_concurrency() -> usize {
    4
}
fn default_harness_ws_url() -> String {
    "ws://127.0.0.1:5225".to_string()
}
fn default_reachability_timeout() -> u64 {
    10
}
fn default_reachability_attempts() -> u32 {
    1
}
fn default_info_page_timeout() -> u64 {
    5
}
fn default_info_page_marker() -> String {
    "simplex".to_string()
}
fn default_official_domain_marker() -> String {
    crate::endpoint::uri::DEFAULT_OFFICIAL_MARKER.to_string()
}

/// 租约与退避时间的上限（7天）
pub const MAX_QUEUE_DELAY_SECONDS: u64 = 7 * 24 * 60 * 60;

/// 配置验证函数
///
/// # 参数
/// * `config` - 要验证的配置
///
/// # 返回
/// * `Result<(), String>` - 验证结果，错误时返回错误信息
pub fn validate_config(config: &Config) -> Result<(), String> {
    // 验证日志级别
    let valid_log_levels = ["debug", "info", "warn", "error"];
    if !valid_log_levels.contains(&config.global.log_level.as_str()) {
        return Err(format!(
            "无效的日志级别: {}，支持的级别: {:?}",
            config.global.log_level, valid_log_levels
        ));
    }

    if config.store.registration_poll_ms == 0 {
        return Err("注册事件轮询间隔不能为0".to_string());
    }

    // 验证队列配置
    if config.queue.name.trim().is_empty() {
        return Err("队列名不能为空".to_string());
    }
    if config.queue.max_attempts == 0 {
        return Err("最大投递次数不能为0".to_string());
    }
    if config.queue.lease_seconds == 0 {
        return Err("任务租约不能为0秒".to_string());
    }
    if config.queue.lease_seconds > MAX_QUEUE_DELAY_SECONDS {
        return Err(format!(
            "任务租约不能超过{}秒: {}",
            MAX_QUEUE_DELAY_SECONDS, config.queue.lease_seconds
        ));
    }
    if config.queue.backoff_seconds > MAX_QUEUE_DELAY_SECONDS {
        return Err(format!(
            "重试退避时间不能超过{}秒: {}",
            MAX_QUEUE_DELAY_SECONDS, config.queue.backoff_seconds
        ));
    }
    if config.queue.poll_interval_ms == 0 {
        return Err("队列轮询间隔不能为0".to_string());
    }

    // 验证调度表达式
    if let Err(e) = crate::scheduler::parse_schedule(&config.scheduler.cron) {
        return Err(format!("无效的cron表达式 {}: {}", config.scheduler.cron, e));
    }

    if config.worker.concurrency == 0 {
        return Err("工作者并发数不能为0".to_string());
    }

    // 验证探测配置
    let probe = &config.probe;
    if !probe.harness_ws_url.starts_with("ws://") && !probe.harness_ws_url.starts_with("wss://") {
        return Err(format!("测试代理地址格式无效: {}", probe.harness_ws_url));
    }
    if probe.reachability_timeout_seconds == 0 {
        return Err("可达性测试超时时间不能为0".to_string());
    }
    if probe.reachability_attempts == 0 {
        return Err("可达性测试尝试次数不能为0".to_string());
    }
    if probe.info_page_timeout_seconds == 0 {
        return Err("信息页面请求超时时间不能为0".to_string());
    }
    if probe.info_page_marker.trim().is_empty() {
        return Err("信息页面标识不能为空".to_string());
    }
    if probe.official_domain_marker.trim().is_empty() {
        return Err("官方域名标识不能为空".to_string());
    }
    if let Some(proxy) = &probe.tor_socks5_proxy {
        if !proxy.starts_with("socks5://") && !proxy.starts_with("socks5h://") {
            return Err(format!("Tor代理地址必须是socks5地址: {}", proxy));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();

        assert_eq!(config.global.log_level, "info");
        assert!(!config.global.dry_run);
        assert_eq!(config.queue.name, "relay-checks");
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.scheduler.cron, "0 */30 * * * *");
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.probe.reachability_timeout_seconds, 10);
        assert_eq!(config.probe.official_domain_marker, "simplex.im");
        assert!(config.geoip.database_path.is_none());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.probe.tor_socks5_proxy = Some("socks5h://127.0.0.1:9050".to_string());

        let serialized = toml::to_string(&config).expect("序列化失败");
        let deserialized: Config = toml::from_str(&serialized).expect("反序列化失败");
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.global.log_level = "verbose".to_string();

        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("无效的日志级别"));
    }

    #[test]
    fn test_config_validation_invalid_cron() {
        let mut config = Config::default();
        config.scheduler.cron = "every half hour".to_string();

        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("cron"));
    }

    #[test]
    fn test_config_validation_queue_delay_bounds() {
        let mut config = Config::default();
        config.queue.backoff_seconds = u64::MAX;
        assert!(validate_config(&config).unwrap_err().contains("退避"));

        let mut config = Config::default();
        config.queue.lease_seconds = MAX_QUEUE_DELAY_SECONDS + 1;
        assert!(validate_config(&config).unwrap_err().contains("租约"));

        let mut config = Config::default();
        config.queue.lease_seconds = MAX_QUEUE_DELAY_SECONDS;
        config.queue.backoff_seconds = MAX_QUEUE_DELAY_SECONDS;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_config_validation_five_field_cron() {
        let mut config = Config::default();
        config.scheduler.cron = "*/30 * * * *".to_string();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_config_validation_zero_values() {
        let mut config = Config::default();
        config.worker.concurrency = 0;
        assert!(validate_config(&config).unwrap_err().contains("并发数"));

        let mut config = Config::default();
        config.probe.reachability_attempts = 0;
        assert!(validate_config(&config).unwrap_err().contains("尝试次数"));

        let mut config = Config::default();
        config.queue.max_attempts = 0;
        assert!(validate_config(&config).unwrap_err().contains("投递次数"));
    }

    #[test]
    fn test_config_validation_invalid_harness_url() {
        let mut config = Config::default();
        config.probe.harness_ws_url = "http://127.0.0.1:5225".to_string();

        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("测试代理地址"));
    }

    #[test]
    fn test_config_validation_invalid_proxy() {
        let mut config = Config::default();
        config.probe.tor_socks5_proxy = Some("http://127.0.0.1:9050".to_string());

        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("socks5"));
    }

    #[test]
    fn test_config_validation_empty_marker() {
        let mut config = Config::default();
        config.probe.info_page_marker = "  ".to_string();

        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("信息页面标识"));
    }
}

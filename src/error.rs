//! 错误处理模块
//!
//! 定义应用程序的统一错误类型

use thiserror::Error;

/// Relay Vitals 应用程序的主要错误类型
#[derive(Error, Debug)]
pub enum RelayVitalsError {
    /// 配置相关错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 可达性探测相关错误
    #[error("探测错误: {0}")]
    Probe(#[from] ProbeError),

    /// 地理位置解析错误
    #[error("地理位置错误: {0}")]
    Geo(#[from] GeoError),

    /// 状态存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),

    /// 任务队列错误
    #[error("队列错误: {0}")]
    Queue(#[from] QueueError),

    /// 检测流水线错误
    #[error("流水线错误: {0}")]
    Pipeline(#[from] PipelineError),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON序列化/反序列化错误
    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 其他错误
    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

/// 配置错误类型
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 配置文件解析错误
    #[error("配置文件解析失败: {0}")]
    ParseError(String),

    /// 配置验证错误
    #[error("配置验证失败: {0}")]
    ValidationError(String),

    /// 配置文件不存在
    #[error("配置文件不存在: {path}")]
    FileNotFound { path: String },

    /// 环境变量替换错误
    #[error("环境变量替换失败: {var}")]
    EnvVarError { var: String },
}

/// 可达性探测错误类型
///
/// 传输层错误（连接失败、超时）会被调用方折叠为“不可达”，
/// 协议错误（响应无法解析）则作为任务失败向上传播。
#[derive(Error, Debug)]
pub enum ProbeError {
    /// 连接、发送或接收失败
    #[error("WebSocket传输失败: {0}")]
    Transport(String),

    /// 等待响应超时
    #[error("等待测试响应超时 ({0}ms)")]
    Timeout(u64),

    /// 响应帧无法解析
    #[error("测试响应格式错误: {0}")]
    Protocol(String),
}

impl ProbeError {
    /// 是否属于网络抖动类错误
    pub fn is_transport(&self) -> bool {
        matches!(self, ProbeError::Transport(_) | ProbeError::Timeout(_))
    }
}

/// 地理位置解析错误类型
#[derive(Error, Debug)]
pub enum GeoError {
    /// DNS解析失败
    #[error("DNS解析失败: {domain}: {reason}")]
    Dns { domain: String, reason: String },

    /// 数据库中没有该地址的国家信息
    #[error("未找到国家信息: {0}")]
    NotFound(String),

    /// GeoIP数据库错误
    #[error("GeoIP数据库错误: {0}")]
    Database(String),
}

/// 状态存储错误类型
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite错误
    #[error("SQLite错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// 后台任务执行失败
    #[error("存储任务执行失败: {0}")]
    Task(String),

    /// 存储不可用
    #[error("存储不可用: {0}")]
    Unavailable(String),
}

/// 任务队列错误类型
#[derive(Error, Debug)]
pub enum QueueError {
    /// SQLite错误
    #[error("SQLite错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// 任务负载格式错误
    #[error("任务负载格式错误: {0}")]
    Payload(#[from] serde_json::Error),

    /// 任务不存在
    #[error("任务不存在: {0}")]
    JobNotFound(u64),

    /// 后台任务执行失败
    #[error("队列任务执行失败: {0}")]
    Task(String),
}

/// 检测流水线错误类型
///
/// 只有协议错误和存储错误会越过单个任务的边界，交给队列的重试机制处理。
#[derive(Error, Debug)]
pub enum PipelineError {
    /// 可达性测试响应无法解析
    #[error("可达性测试协议错误: {0}")]
    Protocol(ProbeError),

    /// 状态存储读写失败
    #[error("状态存储失败: {0}")]
    Store(#[from] StoreError),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RelayVitalsError>;

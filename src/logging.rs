//! 日志系统模块
//!
//! 提供结构化日志配置、单次初始化管理，以及每个检测任务的进度日志

use crate::endpoint::{CheckOutcome, Transition};
use crate::queue::{JobId, WorkQueue};
use chrono::{DateTime, SecondsFormat, Utc};
use log::LevelFilter;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter, Layer};

/// 全局日志初始化状态
#[derive(Debug, Default)]
struct GlobalLoggingState {
    /// 是否已初始化
    initialized: bool,
    /// 初始化失败时的错误信息
    init_error: Option<String>,
    /// 当前配置
    current_config: Option<LogConfig>,
}

/// 全局日志状态管理器
static GLOBAL_LOGGING_STATE: OnceLock<Mutex<GlobalLoggingState>> = OnceLock::new();

fn global_state() -> MutexGuard<'static, GlobalLoggingState> {
    GLOBAL_LOGGING_STATE
        .get_or_init(|| Mutex::new(GlobalLoggingState::default()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 日志配置结构
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: LevelFilter,
    /// 日志文件路径（可选）
    pub file_path: Option<PathBuf>,
    /// 是否输出到控制台
    pub console: bool,
    /// 是否使用JSON格式
    pub json_format: bool,
    /// 模块级别日志控制
    pub module_levels: HashMap<String, LevelFilter>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file_path: None,
            console: true,
            json_format: false,
            module_levels: HashMap::new(),
        }
    }
}

/// 日志系统管理器
#[derive(Debug, Clone)]
pub struct LoggingSystem {
    config: LogConfig,
}

impl LoggingSystem {
    /// 创建日志系统句柄，不安装全局订阅者
    pub fn new(config: LogConfig) -> Self {
        Self { config }
    }

    /// 初始化日志系统
    ///
    /// 进程内只会真正初始化一次，之后的调用直接返回新的句柄。
    ///
    /// # 参数
    /// * `config` - 日志配置
    ///
    /// # 返回
    /// * `Result<LoggingSystem, anyhow::Error>` - 初始化结果
    pub fn setup_logging(config: LogConfig) -> anyhow::Result<Self> {
        let mut state = global_state();
        if state.initialized {
            if let Some(e) = &state.init_error {
                return Err(anyhow::anyhow!("日志系统之前初始化失败: {}", e));
            }
            return Ok(Self::new(config));
        }

        let init_result = Self::perform_initialization(&config);
        state.initialized = true;
        state.current_config = Some(config.clone());
        state.init_error = init_result.as_ref().err().map(|e| e.to_string());
        init_result?;

        Ok(Self::new(config))
    }

    /// 执行实际的日志系统初始化
    fn perform_initialization(config: &LogConfig) -> anyhow::Result<()> {
        Self::init_log_tracer()?;
        Self::init_tracing_subscriber(config)
    }

    /// 初始化 LogTracer（log crate 到 tracing 的桥接）
    fn init_log_tracer() -> anyhow::Result<()> {
        use tracing_log::LogTracer;

        static LOG_TRACER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

        let result = LOG_TRACER_INIT.get_or_init(|| LogTracer::init().map_err(|e| e.to_string()));
        result
            .as_ref()
            .map_err(|e| anyhow::anyhow!("LogTracer初始化失败: {}", e))?;
        Ok(())
    }

    /// 构建环境过滤器
    fn build_env_filter(config: &LogConfig) -> EnvFilter {
        let mut env_filter = EnvFilter::from_default_env()
            .add_directive(Self::convert_level_to_directive(config.level));

        for (module, level) in &config.module_levels {
            match format!("{}={}", module, Self::level_to_string(*level)).parse() {
                Ok(directive) => env_filter = env_filter.add_directive(directive),
                Err(e) => eprintln!("忽略无效的模块日志级别 {}: {}", module, e),
            }
        }
        env_filter
    }

    /// 初始化 tracing subscriber
    fn init_tracing_subscriber(config: &LogConfig) -> anyhow::Result<()> {
        let env_filter = Self::build_env_filter(config);

        let fmt_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_file(true)
                .with_line_number(true)
                .boxed()
        } else {
            fmt::layer()
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(true)
                .boxed()
        };

        let result = match (&config.file_path, config.console) {
            (Some(file_path), false) => {
                let file = std::fs::File::create(file_path)
                    .map_err(|e| anyhow::anyhow!("创建日志文件失败: {}", e))?;
                let file_layer = fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_timer(fmt::time::ChronoUtc::rfc_3339())
                    .with_ansi(false);
                registry().with(env_filter).with(file_layer).try_init()
            }
            _ => registry().with(env_filter).with(fmt_layer).try_init(),
        };

        match result {
            Ok(()) => {
                tracing::info!("日志系统初始化完成");
                tracing::debug!("日志配置: {:?}", config);
                Ok(())
            }
            Err(e) => {
                let error_msg = e.to_string();
                if error_msg.contains(
                    "attempted to set a logger after the logging system was already initialized",
                ) || error_msg.contains("a global default trace dispatcher has already been set")
                {
                    // LogTracer已单独安装，或测试进程中已有其他订阅者
                    tracing::debug!("日志系统已经初始化过了");
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("tracing subscriber初始化失败: {}", error_msg))
                }
            }
        }
    }

    /// 将 log::LevelFilter 转换为 tracing 的指令
    fn convert_level_to_directive(level: LevelFilter) -> tracing_subscriber::filter::Directive {
        use tracing_subscriber::filter::{Directive, LevelFilter as TracingLevel};
        match level {
            LevelFilter::Off => Directive::from(TracingLevel::OFF),
            LevelFilter::Error => Directive::from(tracing::Level::ERROR),
            LevelFilter::Warn => Directive::from(tracing::Level::WARN),
            LevelFilter::Info => Directive::from(tracing::Level::INFO),
            LevelFilter::Debug => Directive::from(tracing::Level::DEBUG),
            LevelFilter::Trace => Directive::from(tracing::Level::TRACE),
        }
    }

    /// 将 log::LevelFilter 转换为字符串
    fn level_to_string(level: LevelFilter) -> &'static str {
        match level {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        }
    }

    /// 检查日志系统是否已初始化
    pub fn is_initialized() -> bool {
        global_state().initialized
    }

    /// 获取当前日志配置（如果已初始化）
    pub fn current_config() -> Option<LogConfig> {
        global_state().current_config.clone()
    }

    /// 重置日志系统状态（主要用于测试）
    #[cfg(test)]
    pub fn reset_for_testing() {
        let mut state = global_state();
        state.initialized = false;
        state.init_error = None;
        state.current_config = None;
    }

    /// 记录一次完成的端点检测
    ///
    /// # 参数
    /// * `uri` - 端点URI
    /// * `outcome` - 检测结果
    /// * `transition` - 状态存储返回的转换，记录已被删除或未写入时为 `None`
    pub fn check_result_log(
        &self,
        uri: &str,
        outcome: &CheckOutcome,
        transition: Option<&Transition>,
    ) {
        let changed = transition.is_some_and(Transition::is_changed);

        if self.config.json_format {
            let entry = json!({
                "timestamp": Utc::now().to_rfc3339(),
                "type": "check_result",
                "uri": uri,
                "reachable": outcome.reachable,
                "country": outcome.country,
                "info_page_available": outcome.info_page_available,
                "status_changed": changed,
            });
            tracing::info!("{entry}");
        } else {
            tracing::info!(
                "CHECK: {} - {} country={} info_page={}{}",
                uri,
                if outcome.reachable { "UP" } else { "DOWN" },
                outcome.country.as_deref().unwrap_or("-"),
                outcome.info_page_available,
                if changed { " (状态变化)" } else { "" }
            );
        }
    }
}

/// 单个任务的进度日志
///
/// 每一行格式为 `<任务ID> | <RFC3339时间> | <消息>`，同时写入 tracing
/// 和队列的任务日志，供外部看板读取。
#[derive(Clone)]
pub struct JobLog {
    job_id: JobId,
    queue: Option<Arc<dyn WorkQueue>>,
}

impl JobLog {
    /// 写入队列任务日志的进度记录器
    pub fn new(job_id: JobId, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            job_id,
            queue: Some(queue),
        }
    }

    /// 只输出到 tracing 的进度记录器
    pub fn detached(job_id: JobId) -> Self {
        Self {
            job_id,
            queue: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// 格式化一行进度日志
    pub fn format_line(job_id: JobId, at: DateTime<Utc>, message: &str) -> String {
        format!(
            "{} | {} | {}",
            job_id,
            at.to_rfc3339_opts(SecondsFormat::Millis, true),
            message
        )
    }

    /// 记录一条进度消息，写入队列失败只会产生警告
    pub async fn log(&self, message: &str) {
        let line = Self::format_line(self.job_id, Utc::now(), message);
        tracing::info!(job_id = self.job_id, "{}", line);

        if let Some(queue) = &self.queue {
            if let Err(e) = queue.append_log(self.job_id, &line).await {
                tracing::warn!(job_id = self.job_id, "写入任务日志失败: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryWorkQueue, JobPayload};
    use chrono::TimeZone;
    use serial_test::serial;
    use tempfile::NamedTempFile;

    fn create_test_config() -> LogConfig {
        LogConfig {
            level: LevelFilter::Info,
            file_path: None,
            console: true,
            json_format: false,
            module_levels: HashMap::new(),
        }
    }

    #[test]
    #[serial]
    fn test_logging_system_single_initialization() {
        LoggingSystem::reset_for_testing();

        let config = create_test_config();
        assert!(LoggingSystem::setup_logging(config.clone()).is_ok());
        assert!(LoggingSystem::is_initialized());

        // 第二次调用不会重复初始化
        assert!(LoggingSystem::setup_logging(config).is_ok());
    }

    #[test]
    #[serial]
    fn test_logging_system_with_file_output() {
        LoggingSystem::reset_for_testing();

        let temp_file = NamedTempFile::new().unwrap();
        let mut config = create_test_config();
        config.file_path = Some(temp_file.path().to_path_buf());
        config.console = false;

        assert!(LoggingSystem::setup_logging(config).is_ok());
    }

    #[test]
    #[serial]
    fn test_current_config_retrieval() {
        LoggingSystem::reset_for_testing();

        let mut config = create_test_config();
        config.json_format = true;
        config
            .module_levels
            .insert("relay_vitals::probe".to_string(), LevelFilter::Debug);
        let _system = LoggingSystem::setup_logging(config.clone()).unwrap();

        let retrieved = LoggingSystem::current_config().unwrap();
        assert_eq!(retrieved.level, config.level);
        assert!(retrieved.json_format);
    }

    #[test]
    fn test_job_log_line_format() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            JobLog::format_line(42, at, "Testing server"),
            "42 | 2026-03-01T12:00:00.000Z | Testing server"
        );
    }

    #[tokio::test]
    async fn test_job_log_appends_to_queue() {
        let queue = Arc::new(InMemoryWorkQueue::default());
        let id = queue
            .enqueue("new smp://a", JobPayload::new("smp://a"))
            .await
            .unwrap();

        let job_log = JobLog::new(id, queue.clone());
        job_log.log("Testing server").await;
        job_log.log("Server is up").await;

        let lines = queue.logs(id).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(&format!("{id} | ")));
        assert!(lines[1].ends_with("| Server is up"));
    }

    #[tokio::test]
    async fn test_job_log_tolerates_unknown_job() {
        let queue = Arc::new(InMemoryWorkQueue::default());
        JobLog::new(7, queue).log("orphan line").await;
        JobLog::detached(8).log("no queue").await;
    }
}

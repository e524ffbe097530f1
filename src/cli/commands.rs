//! CLI命令实现
//!
//! 实现各个CLI子命令的具体逻辑，并负责把配置装配成存储、队列、
//! 调度器和工作者池。

use crate::cli::args::{Args, Commands, OutputFormat};
use crate::config::{Config, ConfigLoader, TomlConfigLoader};
use crate::endpoint::EndpointRecord;
use crate::logging::{JobLog, LoggingSystem};
use crate::probe::{
    CountryResolver, GeoResolver, HttpInfoPageProber, MaxMindLookup, WsReachabilityProber,
};
use crate::queue::{RetryPolicy, SqliteWorkQueue, WorkQueue};
use crate::scheduler::{RescanScheduler, Scheduler};
use crate::store::{SqliteStatusStore, StatusStore};
use crate::worker::{CheckPipeline, PipelineOptions, PipelineOutcome, WorkerPool};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 命令执行trait
#[async_trait]
pub trait Command: Send + Sync {
    /// 执行命令
    async fn execute(&self, args: &Args) -> Result<()>;
}

/// 加载命令行指定或默认位置的配置文件
pub async fn load_config(args: &Args) -> Result<Config> {
    let path = args.get_config_path()?;
    let loader = TomlConfigLoader::default();
    if path.exists() {
        loader
            .load_from_file(&path)
            .await
            .with_context(|| format!("加载配置文件失败: {}", path.display()))
    } else {
        warn!("配置文件不存在，使用默认配置: {}", path.display());
        let config = Config::default();
        loader.validate(&config)?;
        Ok(config)
    }
}

/// 运行时依赖
///
/// 由配置装配而成，供各个命令共享。
pub struct AppContext {
    config: Config,
    store: Arc<SqliteStatusStore>,
    queue: Arc<SqliteWorkQueue>,
}

impl AppContext {
    /// 打开状态存储和任务队列
    pub fn open(config: Config) -> Result<Self> {
        let store = SqliteStatusStore::open(&config.store.database_path).with_context(|| {
            format!("打开状态存储失败: {}", config.store.database_path.display())
        })?;
        let queue = SqliteWorkQueue::open(
            &config.queue.database_path,
            &config.queue.name,
            RetryPolicy::from(&config.queue),
            Duration::from_millis(config.queue.poll_interval_ms),
        )
        .with_context(|| format!("打开任务队列失败: {}", config.queue.database_path.display()))?;

        Ok(Self {
            config,
            store: Arc::new(store),
            queue: Arc::new(queue),
        })
    }

    /// 配置
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 状态存储
    pub fn store(&self) -> Arc<SqliteStatusStore> {
        self.store.clone()
    }

    /// 任务队列
    pub fn queue(&self) -> Arc<SqliteWorkQueue> {
        self.queue.clone()
    }

    /// 构建检测流水线
    pub fn build_pipeline(&self, dry_run: bool) -> Result<CheckPipeline> {
        let probe = &self.config.probe;

        let reachability = WsReachabilityProber::new(
            probe.harness_ws_url.clone(),
            Duration::from_secs(probe.reachability_timeout_seconds),
        );
        let info_page = HttpInfoPageProber::new(
            Duration::from_secs(probe.info_page_timeout_seconds),
            &probe.info_page_marker,
            probe.tor_socks5_proxy.as_deref(),
        )
        .context("创建信息页面探测器失败")?;

        let geo: Option<Arc<dyn CountryResolver>> = match &self.config.geoip.database_path {
            Some(path) => {
                let lookup = MaxMindLookup::open(path)
                    .with_context(|| format!("打开GeoIP数据库失败: {}", path.display()))?;
                Some(Arc::new(GeoResolver::new(Arc::new(lookup))) as Arc<dyn CountryResolver>)
            }
            None => {
                warn!("未配置GeoIP数据库，跳过国家解析");
                None
            }
        };

        Ok(CheckPipeline::new(
            self.store.clone(),
            Arc::new(reachability),
            Arc::new(info_page),
            geo,
            PipelineOptions {
                official_marker: probe.official_domain_marker.clone(),
                reachability_attempts: probe.reachability_attempts,
                dry_run,
            },
        ))
    }

    /// 构建调度器
    pub fn build_scheduler(&self) -> Result<RescanScheduler> {
        RescanScheduler::new(
            self.store.clone(),
            self.queue.clone(),
            &self.config.scheduler.cron,
            &self.config.probe.official_domain_marker,
        )
    }

    /// 构建工作者池
    pub fn build_worker_pool(
        &self,
        logging: LoggingSystem,
        concurrency: usize,
    ) -> Result<WorkerPool> {
        let pipeline = self.build_pipeline(self.config.global.dry_run)?;
        Ok(WorkerPool::new(
            self.queue.clone(),
            Arc::new(pipeline),
            logging,
            concurrency,
            Duration::from_millis(self.config.queue.poll_interval_ms),
        ))
    }

    /// 启动注册事件监视任务
    async fn spawn_registration_watcher(&self) -> Result<tokio::task::JoinHandle<()>> {
        let interval = Duration::from_millis(self.config.store.registration_poll_ms);
        Ok(self.store.spawn_registration_watcher(interval).await?)
    }
}

/// 等待退出信号
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await.context("监听退出信号失败")?;
    info!("收到退出信号，开始关闭");
    Ok(())
}

/// 同时运行调度器和工作者
pub struct RunCommand {
    pub config: Config,
    pub logging: LoggingSystem,
}

#[async_trait]
impl Command for RunCommand {
    async fn execute(&self, _args: &Args) -> Result<()> {
        let context = AppContext::open(self.config.clone())?;

        let scheduler = if context.config().scheduler.enabled {
            let scheduler = context.build_scheduler()?;
            let watcher = context.spawn_registration_watcher().await?;
            scheduler.start().await?;
            Some((scheduler, watcher))
        } else {
            info!("调度器已在配置中禁用");
            None
        };

        let pool = if context.config().worker.enabled {
            let pool =
                context.build_worker_pool(self.logging.clone(), context.config().worker.concurrency)?;
            pool.start().await?;
            Some(pool)
        } else {
            info!("工作者已在配置中禁用");
            None
        };

        if scheduler.is_none() && pool.is_none() {
            warn!("调度器和工作者都已禁用，没有需要运行的组件");
            return Ok(());
        }

        wait_for_shutdown().await?;

        if let Some((scheduler, watcher)) = scheduler {
            watcher.abort();
            scheduler.stop().await?;
        }
        if let Some(pool) = pool {
            pool.stop().await?;
        }

        info!("{} 已退出", crate::APP_NAME);
        Ok(())
    }
}

/// 只运行工作者
pub struct WorkerCommand {
    pub config: Config,
    pub logging: LoggingSystem,
}

#[async_trait]
impl Command for WorkerCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let concurrency = match &args.command {
            Commands::Worker {
                concurrency: Some(concurrency),
            } => *concurrency,
            _ => self.config.worker.concurrency,
        };

        let context = AppContext::open(self.config.clone())?;
        let pool = context.build_worker_pool(self.logging.clone(), concurrency)?;
        pool.start().await?;

        wait_for_shutdown().await?;
        pool.stop().await?;

        let status = pool.get_status().await;
        info!(
            "工作者已退出，完成 {} 个任务，失败 {} 次",
            status.completed, status.failed
        );
        Ok(())
    }
}

/// 只运行调度器
pub struct SchedulerCommand {
    pub config: Config,
}

#[async_trait]
impl Command for SchedulerCommand {
    async fn execute(&self, _args: &Args) -> Result<()> {
        let context = AppContext::open(self.config.clone())?;
        let scheduler = context.build_scheduler()?;
        let watcher = context.spawn_registration_watcher().await?;
        scheduler.start().await?;

        wait_for_shutdown().await?;

        watcher.abort();
        scheduler.stop().await?;

        let status = scheduler.get_status().await;
        info!(
            "调度器已退出，新端点任务 {} 个，最近一次重扫入队 {} 个",
            status.reactive_jobs, status.last_rescan_jobs
        );
        Ok(())
    }
}

/// 入队一次全量重扫
pub struct RescanCommand {
    pub config: Config,
}

#[async_trait]
impl Command for RescanCommand {
    async fn execute(&self, _args: &Args) -> Result<()> {
        let context = AppContext::open(self.config.clone())?;
        let scheduler = context.build_scheduler()?;
        let count = scheduler.enqueue_full_rescan().await?;
        println!("✓ 已入队 {count} 个检测任务");
        Ok(())
    }
}

/// 在当前进程中检测单个端点
pub struct CheckCommand {
    pub config: Config,
    pub logging: LoggingSystem,
}

#[async_trait]
impl Command for CheckCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::Check { uri, dry, format } = &args.command else {
            return Ok(());
        };

        let context = AppContext::open(self.config.clone())?;
        let pipeline = context.build_pipeline(*dry || self.config.global.dry_run)?;
        let outcome = pipeline
            .run(uri, &JobLog::detached(0))
            .await
            .with_context(|| format!("检测端点失败: {uri}"))?;

        match format {
            OutputFormat::Json => {
                let dry_run = matches!(
                    outcome,
                    PipelineOutcome::DryRun(_) | PipelineOutcome::OfficialSkipped
                );
                let value = serde_json::json!({
                    "uri": uri,
                    "outcome": outcome.check_outcome(),
                    "official": outcome.check_outcome().is_none(),
                    "dryRun": dry_run,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            OutputFormat::Text => match &outcome {
                PipelineOutcome::OfficialRemoved { deleted } => {
                    println!("官方端点，记录{}", if *deleted { "已删除" } else { "不存在" });
                }
                PipelineOutcome::OfficialSkipped => println!("官方端点，演练模式下未删除"),
                PipelineOutcome::Checked { outcome, .. } | PipelineOutcome::DryRun(outcome) => {
                    println!("端点: {uri}");
                    println!("  可达: {}", if outcome.reachable { "是" } else { "否" });
                    println!("  国家: {}", outcome.country.as_deref().unwrap_or("-"));
                    println!(
                        "  信息页面: {}",
                        if outcome.info_page_available { "有" } else { "无" }
                    );
                }
            },
        }

        if let PipelineOutcome::Checked { outcome, update } = &outcome {
            let transition = match update {
                crate::endpoint::UpdateOutcome::Applied(transition) => Some(transition),
                crate::endpoint::UpdateOutcome::Missing => {
                    println!("  注意: 端点未注册，结果未写入");
                    None
                }
            };
            self.logging.check_result_log(uri, outcome, transition);
        }
        Ok(())
    }
}

/// 注册新端点
pub struct RegisterCommand {
    pub config: Config,
}

#[async_trait]
impl Command for RegisterCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::Register { uri } = &args.command else {
            return Ok(());
        };

        let context = AppContext::open(self.config.clone())?;
        if context.store().register(uri).await? {
            println!("✓ 已注册端点: {uri}");
        } else {
            println!("端点已存在: {uri}");
        }
        Ok(())
    }
}

/// 列出所有端点
pub struct ListCommand {
    pub config: Config,
}

#[async_trait]
impl Command for ListCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::List { format } = &args.command else {
            return Ok(());
        };

        let context = AppContext::open(self.config.clone())?;
        let records = context.store().get_all().await?;
        let counts = context.queue().counts().await?;

        match format {
            OutputFormat::Json => {
                let value = serde_json::json!({
                    "endpoints": records,
                    "queue": {
                        "waiting": counts.waiting,
                        "active": counts.active,
                        "completed": counts.completed,
                        "failed": counts.failed,
                    },
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            OutputFormat::Text => {
                for record in &records {
                    println!("{}", format_record(record));
                }
                println!(
                    "共 {} 个端点；队列: 等待 {} / 执行中 {} / 完成 {} / 失败 {}",
                    records.len(),
                    counts.waiting,
                    counts.active,
                    counts.completed,
                    counts.failed
                );
            }
        }
        Ok(())
    }
}

/// 格式化单条端点记录
fn format_record(record: &EndpointRecord) -> String {
    format!(
        "[{}] {} country={} info_page={} last_check={}",
        record.state(),
        record.uri,
        record.country.as_deref().unwrap_or("-"),
        record.info_page_available,
        record
            .last_check
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    )
}

/// 验证配置命令
pub struct ValidateCommand;

#[async_trait]
impl Command for ValidateCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        if let Commands::Validate {
            config_path,
            verbose,
        } = &args.command
        {
            let config_file = match config_path {
                Some(path) => path.clone(),
                None => args.get_config_path()?,
            };

            self.validate_config_file(&config_file, *verbose).await
        } else {
            Ok(())
        }
    }
}

impl ValidateCommand {
    /// 验证配置文件
    async fn validate_config_file(&self, config_path: &Path, verbose: bool) -> Result<()> {
        println!("验证配置文件: {}", config_path.display());

        let loader = TomlConfigLoader::new(true);
        let config = loader.load_from_file(config_path).await?;

        if verbose {
            println!("配置验证通过！");
            println!("  日志级别: {}", config.global.log_level);
            println!("  演练模式: {}", if config.global.dry_run { "是" } else { "否" });
            println!("  状态存储: {}", config.store.database_path.display());
            println!(
                "  任务队列: {} ({})",
                config.queue.name,
                config.queue.database_path.display()
            );
            println!(
                "  重试策略: 最多 {} 次，退避 {}秒，租约 {}秒",
                config.queue.max_attempts, config.queue.backoff_seconds, config.queue.lease_seconds
            );
            println!(
                "  调度器: {} ({})",
                if config.scheduler.enabled { "启用" } else { "禁用" },
                config.scheduler.cron
            );
            println!(
                "  工作者: {} (并发 {})",
                if config.worker.enabled { "启用" } else { "禁用" },
                config.worker.concurrency
            );
            println!("  测试服务: {}", config.probe.harness_ws_url);
            println!(
                "  GeoIP数据库: {}",
                config
                    .geoip
                    .database_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "未配置".to_string())
            );
        } else {
            println!("✓ 配置文件验证通过");
        }

        Ok(())
    }
}

/// 版本命令
pub struct VersionCommand;

#[async_trait]
impl Command for VersionCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        if let Commands::Version { format } = &args.command {
            match format {
                OutputFormat::Json => {
                    let version_info = serde_json::json!({
                        "name": crate::APP_NAME,
                        "version": crate::VERSION,
                        "description": crate::APP_DESCRIPTION
                    });
                    println!("{}", serde_json::to_string_pretty(&version_info)?);
                }
                OutputFormat::Text => {
                    println!("{} v{}", crate::APP_NAME, crate::VERSION);
                    println!("{}", crate::APP_DESCRIPTION);
                }
            }
        }
        Ok(())
    }
}

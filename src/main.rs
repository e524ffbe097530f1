//! Relay Vitals 主程序入口
//!
//! 中继服务器健康监控工具

use anyhow::{Context, Result};
use clap::Parser;
use relay_vitals::cli::args::{Args, Commands};
use relay_vitals::cli::commands::{
    load_config, CheckCommand, Command, ListCommand, RegisterCommand, RescanCommand, RunCommand,
    SchedulerCommand, ValidateCommand, VersionCommand, WorkerCommand,
};
use relay_vitals::config::Config;
use relay_vitals::logging::{LogConfig, LoggingSystem};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    // 版本和配置验证命令不依赖已加载的配置
    let config = match &args.command {
        Commands::Version { .. } | Commands::Validate { .. } => None,
        _ => Some(load_config(&args).await?),
    };

    // 初始化日志系统
    let log_config = build_log_config(&args, config.as_ref())?;
    let logging = LoggingSystem::setup_logging(log_config).context("初始化日志系统失败")?;

    info!("Relay Vitals v{} 启动", relay_vitals::VERSION);

    // 执行命令
    if let Err(e) = execute_command(&args, config, logging).await {
        error!("命令执行失败: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// 命令行参数优先于配置文件中的日志级别
fn build_log_config(args: &Args, config: Option<&Config>) -> Result<LogConfig> {
    let level = match (&args.log_level, config) {
        (Some(level), _) => level.clone().into(),
        (None, Some(config)) => config
            .global
            .log_level
            .parse::<log::LevelFilter>()
            .with_context(|| format!("无效的日志级别: {}", config.global.log_level))?,
        (None, None) => log::LevelFilter::Info,
    };

    Ok(LogConfig {
        level,
        file_path: args.log_file.clone(),
        console: args.log_file.is_none(),
        json_format: args.json_logs,
        ..Default::default()
    })
}

/// 执行CLI命令
async fn execute_command(
    args: &Args,
    config: Option<Config>,
    logging: LoggingSystem,
) -> Result<()> {
    let command: Box<dyn Command> = match (&args.command, config) {
        (Commands::Version { .. }, _) => Box::new(VersionCommand),
        (Commands::Validate { .. }, _) => Box::new(ValidateCommand),
        (_, None) => anyhow::bail!("缺少配置"),
        (Commands::Run, Some(config)) => Box::new(RunCommand { config, logging }),
        (Commands::Worker { .. }, Some(config)) => Box::new(WorkerCommand { config, logging }),
        (Commands::Scheduler, Some(config)) => Box::new(SchedulerCommand { config }),
        (Commands::Rescan, Some(config)) => Box::new(RescanCommand { config }),
        (Commands::Check { .. }, Some(config)) => Box::new(CheckCommand { config, logging }),
        (Commands::Register { .. }, Some(config)) => Box::new(RegisterCommand { config }),
        (Commands::List { .. }, Some(config)) => Box::new(ListCommand { config }),
    };

    command.execute(args).await
}

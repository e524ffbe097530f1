//! 命令行参数定义
//!
//! 使用clap定义应用程序的命令行接口

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Relay Vitals - 中继服务器健康监控工具
#[derive(Parser, Debug, Clone)]
#[command(
    name = "relay-vitals",
    version = crate::VERSION,
    about = crate::APP_DESCRIPTION,
    long_about = None
)]
pub struct Args {
    /// 配置文件路径
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "配置文件路径",
        env = "RELAY_VITALS_CONFIG"
    )]
    pub config: Option<PathBuf>,

    /// 日志级别，未指定时使用配置文件中的级别
    #[arg(
        short,
        long,
        value_enum,
        help = "日志级别",
        env = "RELAY_VITALS_LOG_LEVEL"
    )]
    pub log_level: Option<LogLevel>,

    /// 以JSON格式输出日志
    #[arg(long, help = "以JSON格式输出日志")]
    pub json_logs: bool,

    /// 日志文件路径
    #[arg(long, value_name = "FILE", help = "日志文件路径")]
    pub log_file: Option<PathBuf>,

    /// 子命令
    #[command(subcommand)]
    pub command: Commands,
}

/// 日志级别枚举
#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum LogLevel {
    /// 调试级别
    Debug,
    /// 信息级别
    Info,
    /// 警告级别
    Warn,
    /// 错误级别
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// 子命令定义
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// 同时运行调度器和工作者
    Run,

    /// 只运行工作者
    Worker {
        /// 并发工作者数量，覆盖配置文件
        #[arg(
            short,
            long,
            value_name = "COUNT",
            help = "并发工作者数量",
            env = "RELAY_VITALS_CONCURRENCY"
        )]
        concurrency: Option<usize>,
    },

    /// 只运行调度器
    Scheduler,

    /// 入队一次全量重扫后退出
    Rescan,

    /// 在当前进程中检测单个端点
    Check {
        /// 端点URI
        #[arg(value_name = "URI", help = "端点URI")]
        uri: String,

        /// 只探测，不修改状态存储
        #[arg(long, help = "只探测，不修改状态存储")]
        dry: bool,

        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        format: OutputFormat,
    },

    /// 注册新端点
    Register {
        /// 端点URI
        #[arg(value_name = "URI", help = "端点URI")]
        uri: String,
    },

    /// 列出所有端点状态
    List {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        format: OutputFormat,
    },

    /// 验证配置文件
    Validate {
        /// 配置文件路径
        #[arg(value_name = "FILE", help = "配置文件路径")]
        config_path: Option<PathBuf>,

        /// 是否显示详细信息
        #[arg(short, long, help = "显示详细信息")]
        verbose: bool,
    },

    /// 显示版本信息
    Version {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        format: OutputFormat,
    },
}

/// 输出格式枚举
#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum OutputFormat {
    /// 文本格式
    Text,
    /// JSON格式
    Json,
}

impl Args {
    /// 获取配置文件路径
    pub fn get_config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(config) => Ok(config.clone()),
            None => Ok(crate::config::get_default_config_path()),
        }
    }
}

//! 检测任务调度器
//!
//! 两个相互独立的触发源向任务队列投递检测任务：
//! - 按cron表达式周期性地全量重扫所有非官方端点，入队顺序随机打乱
//! - 订阅端点注册事件，每个新端点立即入队一次
//!
//! 两个来源之间不去重，重复检测由流水线的幂等性保证正确。

use crate::endpoint::uri::is_official_with_marker;
use crate::queue::{new_endpoint_job_name, schedule_job_name, JobId, JobPayload, NewJob, WorkQueue};
use crate::store::{EndpointRegistered, StatusStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use rand::seq::SliceRandom;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 解析cron表达式
///
/// 接受带秒字段的六段/七段表达式，五段式表达式会在前面补上 `0` 秒。
pub fn parse_schedule(expression: &str) -> Result<Schedule, cron::error::Error> {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {expression}"))
    } else {
        Schedule::from_str(expression)
    }
}

/// 均匀随机打乱端点顺序
///
/// 避免同一托管商下相邻存储的端点在同一时刻被集中检测。
pub fn shuffle_endpoints<T>(items: &mut [T]) {
    items.shuffle(&mut rand::thread_rng());
}

/// 调度器状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    /// 调度器是否运行中
    pub is_running: bool,
    /// 最近一次全量重扫时间
    pub last_rescan: Option<DateTime<Utc>>,
    /// 最近一次全量重扫入队的任务数
    pub last_rescan_jobs: usize,
    /// 已入队的新端点任务数
    pub reactive_jobs: u64,
    /// 下一次计划的全量重扫时间
    pub next_rescan: Option<DateTime<Utc>>,
}

/// 调度器trait，定义调度接口
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// 启动调度器
    async fn start(&self) -> Result<()>;

    /// 停止调度器
    async fn stop(&self) -> Result<()>;

    /// 获取调度器状态
    async fn get_status(&self) -> SchedulerStatus;
}

/// 两种触发源共享的入队逻辑
#[derive(Clone)]
struct Trigger {
    store: Arc<dyn StatusStore>,
    queue: Arc<dyn WorkQueue>,
    official_marker: String,
    status: Arc<RwLock<SchedulerStatus>>,
}

impl Trigger {
    async fn full_rescan(&self) -> Result<usize> {
        let records = self.store.get_all().await.context("读取端点列表失败")?;

        let mut uris: Vec<String> = records
            .into_iter()
            .map(|record| record.uri)
            .filter(|uri| !is_official_with_marker(uri, &self.official_marker))
            .collect();
        shuffle_endpoints(&mut uris);

        let jobs: Vec<NewJob> = uris
            .into_iter()
            .map(|uri| NewJob::new(schedule_job_name(&uri), JobPayload::new(uri)))
            .collect();
        let count = jobs.len();
        self.queue.enqueue_many(jobs).await.context("全量重扫入队失败")?;

        {
            let mut status = self.status.write().await;
            status.last_rescan = Some(Utc::now());
            status.last_rescan_jobs = count;
        }

        info!("全量重扫已入队 {} 个端点", count);
        Ok(count)
    }

    async fn enqueue_registered(&self, uri: &str) -> Result<JobId> {
        let id = self
            .queue
            .enqueue(&new_endpoint_job_name(uri), JobPayload::new(uri))
            .await
            .with_context(|| format!("新端点入队失败: {uri}"))?;

        self.status.write().await.reactive_jobs += 1;
        debug!(job_id = id, uri = %uri, "新端点已入队");
        Ok(id)
    }
}

/// 全量重扫与新端点触发调度器
pub struct RescanScheduler {
    trigger: Trigger,
    schedule: Schedule,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RescanScheduler {
    /// 创建新的调度器
    ///
    /// # 参数
    /// * `store` - 状态存储，提供端点列表与注册事件
    /// * `queue` - 任务队列
    /// * `cron_expression` - 全量重扫的cron表达式
    /// * `official_marker` - 官方端点的域名标识
    pub fn new(
        store: Arc<dyn StatusStore>,
        queue: Arc<dyn WorkQueue>,
        cron_expression: &str,
        official_marker: &str,
    ) -> Result<Self> {
        let schedule = parse_schedule(cron_expression)
            .with_context(|| format!("无效的cron表达式: {cron_expression}"))?;

        Ok(Self {
            trigger: Trigger {
                store,
                queue,
                official_marker: official_marker.to_string(),
                status: Arc::new(RwLock::new(SchedulerStatus::default())),
            },
            schedule,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// 立即执行一次全量重扫，返回入队的任务数
    pub async fn enqueue_full_rescan(&self) -> Result<usize> {
        self.trigger.full_rescan().await
    }

    /// 为新注册的端点入队一个检测任务
    pub async fn enqueue_registered(&self, uri: &str) -> Result<JobId> {
        self.trigger.enqueue_registered(uri).await
    }

    fn spawn_cron_task(&self) -> JoinHandle<()> {
        let trigger = self.trigger.clone();
        let schedule = self.schedule.clone();

        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!("cron表达式没有后续触发时间，停止全量重扫");
                    break;
                };
                trigger.status.write().await.next_rescan = Some(next);

                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!("下一次全量重扫: {} ({:?}后)", next, delay);
                tokio::time::sleep(delay).await;

                if let Err(e) = trigger.full_rescan().await {
                    error!("全量重扫失败: {:#}", e);
                }
            }
        })
    }

    fn spawn_registration_task(&self) -> JoinHandle<()> {
        let trigger = self.trigger.clone();
        // 在启动任务前订阅，避免遗漏启动期间的注册事件
        let mut events = trigger.store.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EndpointRegistered { uri }) => {
                        if let Err(e) = trigger.enqueue_registered(&uri).await {
                            error!("{:#}", e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // 遗漏的端点通过一次全量重扫补齐
                        warn!("注册事件积压，丢失 {} 条，执行一次全量重扫", skipped);
                        if let Err(e) = trigger.full_rescan().await {
                            error!("补偿性全量重扫失败: {:#}", e);
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("注册事件流已关闭");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Scheduler for RescanScheduler {
    async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("调度器已在运行");
            return Ok(());
        }

        info!("启动调度器");
        {
            let mut status = self.trigger.status.write().await;
            status.is_running = true;
            status.next_rescan = self.schedule.upcoming(Utc).next();
        }

        tasks.push(self.spawn_registration_task());
        tasks.push(self.spawn_cron_task());

        info!("调度器启动完成");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("停止调度器");

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }

        {
            let mut status = self.trigger.status.write().await;
            status.is_running = false;
            status.next_rescan = None;
        }

        info!("调度器已停止");
        Ok(())
    }

    async fn get_status(&self) -> SchedulerStatus {
        self.trigger.status.read().await.clone()
    }
}

impl Drop for RescanScheduler {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

//! 工作者池
//!
//! 固定数量的工作者任务从共享队列领取任务并执行检测流水线。
//! 停止时发出广播信号，正在执行的任务会先完成再退出。

use super::pipeline::{CheckPipeline, PipelineOutcome};
use crate::logging::{JobLog, LoggingSystem};
use crate::queue::{Job, JobState, WorkQueue};
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 工作者池状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerPoolStatus {
    /// 是否运行中
    pub is_running: bool,
    /// 工作者数量
    pub workers: usize,
    /// 成功完成的任务数
    pub completed: u64,
    /// 失败的任务数（含等待重试）
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// 单个工作者共享的依赖
#[derive(Clone)]
struct WorkerContext {
    queue: Arc<dyn WorkQueue>,
    pipeline: Arc<CheckPipeline>,
    logging: LoggingSystem,
    counters: Arc<Counters>,
    poll_wait: Duration,
}

impl WorkerContext {
    async fn run(self, worker_id: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!("工作者 {} 已启动", worker_id);
        // 领取过程不可取消，已领取的任务必须处理完，停止信号只在两次领取之间检查
        while !shutdown_requested(&mut shutdown) {
            match self.queue.reserve(self.poll_wait).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(e) => {
                    error!("领取任务失败: {}", e);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.poll_wait) => {}
                    }
                }
            }
        }
        debug!("工作者 {} 已退出", worker_id);
    }

    async fn process(&self, job: Job) {
        let uri = job.payload.endpoint_uri.as_str();
        let log = JobLog::new(job.id, self.queue.clone());
        log.log(&format!("开始任务 {} (第 {} 次)", job.name, job.attempts))
            .await;

        match self.pipeline.run(uri, &log).await {
            Ok(outcome) => {
                self.report(uri, &outcome);
                match self.queue.complete(&job).await {
                    Ok(true) => {}
                    Ok(false) => warn!(job_id = job.id, "任务租约已失效，完成结果未记录"),
                    Err(e) => warn!(job_id = job.id, "标记任务完成失败: {}", e),
                }
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log.log(&format!("任务失败: {e}")).await;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                match self.queue.fail(&job, &e.to_string()).await {
                    Ok(Some(JobState::Waiting)) => {
                        warn!(job_id = job.id, uri = %uri, "任务失败，等待重试: {}", e)
                    }
                    Ok(Some(_)) => error!(job_id = job.id, uri = %uri, "任务最终失败: {}", e),
                    Ok(None) => warn!(job_id = job.id, "任务租约已失效，失败结果未记录: {}", e),
                    Err(queue_err) => {
                        error!(job_id = job.id, "记录任务失败出错: {}", queue_err)
                    }
                }
            }
        }
    }

    fn report(&self, uri: &str, outcome: &PipelineOutcome) {
        match outcome {
            PipelineOutcome::Checked { outcome, update } => {
                let transition = match update {
                    crate::endpoint::UpdateOutcome::Applied(transition) => Some(transition),
                    crate::endpoint::UpdateOutcome::Missing => None,
                };
                self.logging.check_result_log(uri, outcome, transition);
            }
            PipelineOutcome::DryRun(outcome) => self.logging.check_result_log(uri, outcome, None),
            PipelineOutcome::OfficialRemoved { deleted } => {
                info!(uri = %uri, deleted = *deleted, "官方端点已移除");
            }
            PipelineOutcome::OfficialSkipped => debug!(uri = %uri, "官方端点已跳过"),
        }
    }
}

/// 停止信号已发出或发送端已关闭
fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

/// 工作者池
pub struct WorkerPool {
    context: WorkerContext,
    concurrency: usize,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// 创建工作者池
    ///
    /// # 参数
    /// * `queue` - 任务队列
    /// * `pipeline` - 检测流水线
    /// * `logging` - 日志系统，用于输出检测结果
    /// * `concurrency` - 工作者数量
    /// * `poll_wait` - 单次领取任务的最长等待时间
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        pipeline: Arc<CheckPipeline>,
        logging: LoggingSystem,
        concurrency: usize,
        poll_wait: Duration,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            context: WorkerContext {
                queue,
                pipeline,
                logging,
                counters: Arc::new(Counters::default()),
                poll_wait,
            },
            concurrency: concurrency.max(1),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// 启动所有工作者
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            warn!("工作者池已在运行");
            return Ok(());
        }

        for worker_id in 0..self.concurrency {
            let context = self.context.clone();
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(context.run(worker_id, shutdown)));
        }

        info!("工作者池已启动，并发数: {}", self.concurrency);
        Ok(())
    }

    /// 停止所有工作者，等待正在执行的任务完成
    pub async fn stop(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        if handles.is_empty() {
            return Ok(());
        }

        info!("停止工作者池");
        let _ = self.shutdown.send(());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("工作者任务异常退出: {}", e);
            }
        }

        info!("工作者池已停止");
        Ok(())
    }

    /// 获取工作者池状态
    pub async fn get_status(&self) -> WorkerPoolStatus {
        let workers = self.handles.lock().await.len();
        WorkerPoolStatus {
            is_running: workers > 0,
            workers,
            completed: self.context.counters.completed.load(Ordering::Relaxed),
            failed: self.context.counters.failed.load(Ordering::Relaxed),
        }
    }
}

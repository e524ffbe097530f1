//! 任务队列模块
//!
//! 持久化、至少一次投递的任务代理，将触发器与执行者解耦。
//! 任务不去重，重复投递由检测流水线的幂等性兜底。

pub mod memory;
pub mod sqlite;

use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

pub use memory::InMemoryWorkQueue;
pub use sqlite::SqliteWorkQueue;

/// 任务ID
pub type JobId = u64;

/// 指数退避的最大倍数指数
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// 租约过期且投递次数用尽时记录的错误
pub const LEASE_EXHAUSTED_ERROR: &str = "任务租约已过期，投递次数已用尽";

/// 约30年
const FAR_FUTURE_SECONDS: u64 = 86400 * 365 * 30;

/// 饱和的时间相加，溢出时取一个足够远的时间点
pub(crate) fn instant_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECONDS))
}

/// 任务负载
///
/// 只携带端点URI，其余信息由执行者重新推导。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobPayload {
    #[serde(rename = "endpointUri")]
    pub endpoint_uri: String,
}

impl JobPayload {
    pub fn new(endpoint_uri: impl Into<String>) -> Self {
        Self {
            endpoint_uri: endpoint_uri.into(),
        }
    }
}

/// 全量重扫任务名
pub fn schedule_job_name(uri: &str) -> String {
    format!("schedule {uri}")
}

/// 新注册端点任务名
pub fn new_endpoint_job_name(uri: &str) -> String {
    format!("new {uri}")
}

/// 待入队的任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub name: String,
    pub payload: JobPayload,
}

impl NewJob {
    pub fn new(name: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// 已投递给执行者的任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub payload: JobPayload,
    /// 包含本次在内的投递次数
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("未知的任务状态: {other}")),
        }
    }
}

/// 任务详情，供观测使用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job: Job,
    pub state: JobState,
    pub last_error: Option<String>,
}

/// 各状态任务数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed
    }

    fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Waiting => self.waiting += count,
            JobState::Active => self.active += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
        }
    }
}

/// 重试与租约策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大投递次数
    pub max_attempts: u32,
    /// 首次重试的等待时间，之后逐次翻倍
    pub backoff: Duration,
    /// 执行租约，超时未完成的任务会被重新投递
    pub lease: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
            lease: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempts` 次失败后的重试等待时间，已用尽时返回 `None`
    pub fn retry_delay(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let exponent = attempts.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        Some(
            self.backoff
                .checked_mul(2u32.pow(exponent))
                .unwrap_or(Duration::MAX),
        )
    }
}

impl From<&crate::config::QueueConfig> for RetryPolicy {
    fn from(config: &crate::config::QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Duration::from_secs(config.backoff_seconds),
            lease: Duration::from_secs(config.lease_seconds),
        }
    }
}

/// 任务队列trait
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// 入队单个任务
    async fn enqueue(&self, name: &str, payload: JobPayload) -> Result<JobId, QueueError>;

    /// 按给定顺序批量入队
    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, QueueError>;

    /// 领取一个可执行的任务，最多等待 `wait`
    ///
    /// 租约过期的活动任务会被再次领取；投递次数已用尽的则直接标记为失败。
    async fn reserve(&self, wait: Duration) -> Result<Option<Job>, QueueError>;

    /// 标记一次投递完成
    ///
    /// 只有仍持有该次投递（任务处于执行中且投递次数一致）时才会生效，
    /// 租约过期后被重新领取的旧投递返回 `false` 且不做任何修改。
    async fn complete(&self, job: &Job) -> Result<bool, QueueError>;

    /// 记录一次投递失败，返回任务的新状态（等待重试或最终失败）
    ///
    /// 投递已失效时返回 `None` 且不做任何修改。
    async fn fail(&self, job: &Job, error: &str) -> Result<Option<JobState>, QueueError>;

    /// 追加一行任务日志
    async fn append_log(&self, id: JobId, line: &str) -> Result<(), QueueError>;

    /// 读取任务日志
    async fn logs(&self, id: JobId) -> Result<Vec<String>, QueueError>;

    /// 读取任务详情
    async fn job(&self, id: JobId) -> Result<Option<JobInfo>, QueueError>;

    /// 各状态的任务数量
    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_shape() {
        let payload = JobPayload::new("smp://abc@relay.example.com");
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"endpointUri":"smp://abc@relay.example.com"}"#);
    }

    #[test]
    fn test_payload_rejects_unexpected_shapes() {
        assert!(serde_json::from_str::<JobPayload>(r#"{"serverUri":"smp://x"}"#).is_err());
        assert!(serde_json::from_str::<JobPayload>(
            r#"{"endpointUri":"smp://x","priority":1}"#
        )
        .is_err());
    }

    #[test]
    fn test_job_names() {
        assert_eq!(schedule_job_name("smp://a"), "schedule smp://a");
        assert_eq!(new_endpoint_job_name("smp://a"), "new smp://a");
    }

    #[test]
    fn test_retry_delay_doubles_until_exhausted() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
            lease: Duration::from_secs(60),
        };
        assert_eq!(policy.retry_delay(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.retry_delay(2), Some(Duration::from_secs(10)));
        assert_eq!(policy.retry_delay(3), None);
    }

    #[test]
    fn test_retry_delay_saturates() {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            backoff: Duration::MAX,
            lease: Duration::from_secs(60),
        };
        assert_eq!(policy.retry_delay(5), Some(Duration::MAX));
        assert_eq!(policy.retry_delay(1), Some(Duration::MAX));
    }

    #[test]
    fn test_job_state_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("stalled".parse::<JobState>().is_err());
    }
}

//! 内存任务队列
//!
//! 单进程使用，进程退出后任务丢失。

use super::{
    instant_after, Job, JobId, JobInfo, JobPayload, JobState, NewJob, QueueCounts, RetryPolicy,
    WorkQueue, LEASE_EXHAUSTED_ERROR,
};
use crate::error::QueueError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
struct Entry {
    job: Job,
    state: JobState,
    run_at: Instant,
    lease_until: Option<Instant>,
    last_error: Option<String>,
    logs: Vec<String>,
}

impl Entry {
    fn is_due(&self, now: Instant) -> bool {
        match self.state {
            JobState::Waiting => self.run_at <= now,
            JobState::Active => self.lease_until.is_some_and(|until| until <= now),
            JobState::Completed | JobState::Failed => false,
        }
    }

    /// 调用方是否仍持有这次投递
    fn is_held_by(&self, job: &Job) -> bool {
        self.state == JobState::Active && self.job.attempts == job.attempts
    }

    /// 下一次可被领取的时间
    fn due_at(&self) -> Option<Instant> {
        match self.state {
            JobState::Waiting => Some(self.run_at),
            JobState::Active => self.lease_until,
            JobState::Completed | JobState::Failed => None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: JobId,
    entries: HashMap<JobId, Entry>,
}

/// 内存任务队列
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    policy: RetryPolicy,
}

impl InMemoryWorkQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            policy,
        }
    }

    /// 尝试领取一个到期任务，没有时返回最近的到期时间
    async fn try_reserve(&self) -> Reservation {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        loop {
            let next = inner
                .entries
                .values()
                .filter(|entry| entry.is_due(now))
                .min_by_key(|entry| (entry.due_at(), entry.job.id))
                .map(|entry| entry.job.id);

            let Some(entry) = next.and_then(|id| inner.entries.get_mut(&id)) else {
                return Reservation::Idle(inner.entries.values().filter_map(Entry::due_at).min());
            };

            if entry.state == JobState::Active {
                if entry.job.attempts >= self.policy.max_attempts {
                    warn!(job_id = entry.job.id, "任务租约已过期且投递次数已用尽，标记为失败");
                    entry.state = JobState::Failed;
                    entry.lease_until = None;
                    entry.last_error = Some(LEASE_EXHAUSTED_ERROR.to_string());
                    continue;
                }
                debug!(job_id = entry.job.id, "任务租约已过期，重新投递");
            }

            entry.state = JobState::Active;
            entry.job.attempts += 1;
            entry.lease_until = Some(instant_after(now, self.policy.lease));
            return Reservation::Ready(entry.job.clone());
        }
    }
}

enum Reservation {
    Ready(Job),
    Idle(Option<Instant>),
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, name: &str, payload: JobPayload) -> Result<JobId, QueueError> {
        let ids = self.enqueue_many(vec![NewJob::new(name, payload)]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| QueueError::Task("入队未返回任务ID".to_string()))
    }

    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, QueueError> {
        let now = Instant::now();
        let mut ids = Vec::with_capacity(jobs.len());
        {
            let mut inner = self.inner.lock().await;
            for new_job in jobs {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.entries.insert(
                    id,
                    Entry {
                        job: Job {
                            id,
                            name: new_job.name,
                            payload: new_job.payload,
                            attempts: 0,
                            enqueued_at: Utc::now(),
                        },
                        state: JobState::Waiting,
                        run_at: now,
                        lease_until: None,
                        last_error: None,
                        logs: Vec::new(),
                    },
                );
                ids.push(id);
            }
        }

        for _ in &ids {
            self.notify.notify_one();
        }
        Ok(ids)
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = instant_after(Instant::now(), wait);
        loop {
            let next_due = match self.try_reserve().await {
                Reservation::Ready(job) => return Ok(Some(job)),
                Reservation::Idle(next_due) => next_due,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            // 超时或被入队唤醒后重新检查
            let _ = tokio::time::timeout_at(wake_at.max(now), self.notify.notified()).await;
        }
    }

    async fn complete(&self, job: &Job) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(&job.id)
            .ok_or(QueueError::JobNotFound(job.id))?;

        if !entry.is_held_by(job) {
            debug!(job_id = job.id, attempts = job.attempts, "投递已失效，忽略完成标记");
            return Ok(false);
        }
        entry.state = JobState::Completed;
        entry.lease_until = None;
        Ok(true)
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<Option<JobState>, QueueError> {
        let state = {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .entries
                .get_mut(&job.id)
                .ok_or(QueueError::JobNotFound(job.id))?;

            if !entry.is_held_by(job) {
                debug!(job_id = job.id, attempts = job.attempts, "投递已失效，忽略失败记录");
                return Ok(None);
            }

            entry.last_error = Some(error.to_string());
            entry.lease_until = None;
            match self.policy.retry_delay(entry.job.attempts) {
                Some(delay) => {
                    entry.state = JobState::Waiting;
                    entry.run_at = instant_after(Instant::now(), delay);
                }
                None => entry.state = JobState::Failed,
            }
            entry.state
        };

        if state == JobState::Waiting {
            self.notify.notify_one();
        }
        Ok(Some(state))
    }

    async fn append_log(&self, id: JobId, line: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(QueueError::JobNotFound(id))?;
        entry.logs.push(line.to_string());
        Ok(())
    }

    async fn logs(&self, id: JobId) -> Result<Vec<String>, QueueError> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .get(&id)
            .map(|entry| entry.logs.clone())
            .ok_or(QueueError::JobNotFound(id))
    }

    async fn job(&self, id: JobId) -> Result<Option<JobInfo>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(&id).map(|entry| JobInfo {
            job: entry.job.clone(),
            state: entry.state,
            last_error: entry.last_error.clone(),
        }))
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let inner = self.inner.lock().await;
        let mut counts = QueueCounts::default();
        for entry in inner.entries.values() {
            counts.add(entry.state, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(20),
            lease: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_completion() {
        let queue = InMemoryWorkQueue::default();
        queue
            .enqueue("schedule smp://a", JobPayload::new("smp://a"))
            .await
            .unwrap();
        queue
            .enqueue("schedule smp://b", JobPayload::new("smp://b"))
            .await
            .unwrap();

        let first = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.payload.endpoint_uri, "smp://a");
        assert_eq!(second.payload.endpoint_uri, "smp://b");
        assert_eq!(first.attempts, 1);
        assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());

        assert!(queue.complete(&first).await.unwrap());
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 1);
    }

    #[tokio::test]
    async fn test_reserve_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryWorkQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.reserve(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        let job = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(job.name, "new smp://a");
    }

    #[tokio::test]
    async fn test_failure_retries_then_fails() {
        let queue = InMemoryWorkQueue::new(quick_policy());
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(queue.fail(&job, "boom").await.unwrap(), Some(JobState::Waiting));
        // 退避期内不可领取
        assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());

        let retry = queue.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(retry.id, id);
        assert_eq!(retry.attempts, 2);
        assert_eq!(
            queue.fail(&retry, "boom again").await.unwrap(),
            Some(JobState::Failed)
        );

        let info = queue.job(id).await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Failed);
        assert_eq!(info.last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = InMemoryWorkQueue::new(quick_policy());
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        let again = queue.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_stale_delivery_cannot_settle_job() {
        let queue = InMemoryWorkQueue::new(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(20),
            lease: Duration::from_millis(30),
        });
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        let stale = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        let current = queue.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(current.attempts, 2);

        // 旧投递在新投递执行期间不能结束任务
        assert!(!queue.complete(&stale).await.unwrap());
        assert_eq!(queue.job(id).await.unwrap().unwrap().state, JobState::Active);

        assert!(queue.complete(&current).await.unwrap());
        assert_eq!(queue.fail(&stale, "late failure").await.unwrap(), None);

        let info = queue.job(id).await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Completed);
        assert!(info.last_error.is_none());
        assert!(queue.reserve(Duration::from_millis(100)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_fails_when_attempts_exhausted() {
        let queue = InMemoryWorkQueue::new(RetryPolicy {
            max_attempts: 1,
            backoff: Duration::from_millis(10),
            lease: Duration::from_millis(10),
        });
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(queue.reserve(Duration::from_millis(50)).await.unwrap().is_none());

        let info = queue.job(id).await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Failed);
        assert_eq!(info.job.attempts, 1);
        assert_eq!(info.last_error.as_deref(), Some(LEASE_EXHAUSTED_ERROR));
        assert!(!queue.complete(&job).await.unwrap());
    }

    #[tokio::test]
    async fn test_logs_and_unknown_job() {
        let queue = InMemoryWorkQueue::default();
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();
        queue.append_log(id, "1 | t | Testing").await.unwrap();
        assert_eq!(queue.logs(id).await.unwrap(), vec!["1 | t | Testing"]);

        assert!(matches!(
            queue.append_log(99, "x").await,
            Err(QueueError::JobNotFound(99))
        ));
        assert!(queue.job(99).await.unwrap().is_none());
    }

    #[test]
    fn test_enqueue_many_counts() {
        let queue = InMemoryWorkQueue::default();
        let ids = tokio_test::block_on(queue.enqueue_many(vec![
            NewJob::new("schedule smp://a", JobPayload::new("smp://a")),
            NewJob::new("schedule smp://b", JobPayload::new("smp://b")),
        ]))
        .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);

        let counts = tokio_test::block_on(queue.counts()).unwrap();
        assert_eq!(counts.waiting, 2);
        assert_eq!(counts.total(), 2);
    }
}

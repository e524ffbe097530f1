//! SQLite持久化任务队列
//!
//! 多个进程可以共享同一个数据库文件，领取任务在写事务中完成，
//! 同一任务在租约有效期内不会被重复领取。时间以毫秒时间戳存储。

use super::{
    instant_after, Job, JobId, JobInfo, JobPayload, JobState, NewJob, QueueCounts, RetryPolicy,
    WorkQueue, LEASE_EXHAUSTED_ERROR,
};
use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    name TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'waiting',
    attempts INTEGER NOT NULL DEFAULT 0,
    run_at_ms INTEGER NOT NULL,
    lease_until_ms INTEGER,
    last_error TEXT,
    enqueued_at TEXT NOT NULL,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_queue_state ON jobs(queue, state, run_at_ms);
CREATE TABLE IF NOT EXISTS job_logs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    line TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id);";

const JOB_COLUMNS: &str = "id, name, payload, attempts, enqueued_at";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// 读取任务行，负载保持原始文本
fn raw_job_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, u32, DateTime<Utc>)> {
    Ok((
        row.get("id")?,
        row.get("name")?,
        row.get("payload")?,
        row.get("attempts")?,
        row.get("enqueued_at")?,
    ))
}

fn job_from_raw(
    (id, name, payload, attempts, enqueued_at): (i64, String, String, u32, DateTime<Utc>),
) -> Result<Job, QueueError> {
    Ok(Job {
        id: id as JobId,
        name,
        payload: serde_json::from_str(&payload)?,
        attempts,
        enqueued_at,
    })
}

/// 任务不存在时返回 `JobNotFound`
fn ensure_exists(conn: &Connection, id: JobId) -> Result<(), QueueError> {
    conn.query_row("SELECT 1 FROM jobs WHERE id = ?1", [id as i64], |_| Ok(()))
        .optional()?
        .ok_or(QueueError::JobNotFound(id))
}

/// SQLite任务队列
#[derive(Clone)]
pub struct SqliteWorkQueue {
    conn: Arc<Mutex<Connection>>,
    queue: String,
    policy: RetryPolicy,
    poll_interval: Duration,
}

impl SqliteWorkQueue {
    /// 打开或创建队列数据库
    ///
    /// # 参数
    /// * `path` - 数据库文件路径
    /// * `queue` - 队列名，同一文件中的不同队列互不干扰
    /// * `policy` - 重试与租约策略
    /// * `poll_interval` - 空闲时的轮询间隔
    pub fn open<P: AsRef<Path>>(
        path: P,
        queue: &str,
        policy: RetryPolicy,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), queue = %queue, "任务队列已打开");
        Self::init(conn, queue, policy, poll_interval)
    }

    /// 创建内存队列（测试用）
    pub fn open_in_memory(
        queue: &str,
        policy: RetryPolicy,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        Self::init(Connection::open_in_memory()?, queue, policy, poll_interval)
    }

    fn init(
        conn: Connection,
        queue: &str,
        policy: RetryPolicy,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            queue: queue.to_string(),
            policy,
            poll_interval,
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| QueueError::Task("数据库连接锁已失效".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| QueueError::Task(e.to_string()))?
    }

    /// 在一个写事务中领取最早到期的任务
    ///
    /// 负载无法解析的任务直接标记为失败，不会阻塞队列。
    async fn try_reserve(&self) -> Result<Option<Job>, QueueError> {
        let queue = self.queue.clone();
        let lease = duration_ms(self.policy.lease);
        let max_attempts = self.policy.max_attempts;

        self.with_conn(move |conn| loop {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let raw = tx
                .query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS}, state FROM jobs
                         WHERE queue = ?1
                           AND ((state = 'waiting' AND run_at_ms <= ?2)
                             OR (state = 'active' AND lease_until_ms <= ?2))
                         ORDER BY COALESCE(lease_until_ms, run_at_ms), id
                         LIMIT 1"
                    ),
                    params![queue, now],
                    |row| Ok((raw_job_from_row(row)?, row.get::<_, String>("state")?)),
                )
                .optional()?;

            let Some((raw, previous_state)) = raw else {
                return Ok(None);
            };
            let id = raw.0;
            let expired = previous_state == JobState::Active.as_str();

            if expired && raw.3 >= max_attempts {
                warn!(job_id = id, "任务租约已过期且投递次数已用尽，标记为失败");
                tx.execute(
                    "UPDATE jobs SET state = 'failed', last_error = ?2, lease_until_ms = NULL,
                     finished_at = ?3 WHERE id = ?1",
                    params![id, LEASE_EXHAUSTED_ERROR, Utc::now()],
                )?;
                tx.commit()?;
                continue;
            }

            let mut job = match job_from_raw(raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = id, "任务负载格式错误，标记为失败: {}", e);
                    tx.execute(
                        "UPDATE jobs SET state = 'failed', last_error = ?2, lease_until_ms = NULL,
                         finished_at = ?3 WHERE id = ?1",
                        params![id, e.to_string(), Utc::now()],
                    )?;
                    tx.commit()?;
                    continue;
                }
            };

            if expired {
                debug!(job_id = id, "任务租约已过期，重新投递");
            }

            tx.execute(
                "UPDATE jobs SET state = 'active', attempts = attempts + 1, lease_until_ms = ?2
                 WHERE id = ?1",
                params![id, now.saturating_add(lease)],
            )?;
            tx.commit()?;

            job.attempts += 1;
            return Ok(Some(job));
        })
        .await
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, name: &str, payload: JobPayload) -> Result<JobId, QueueError> {
        let ids = self.enqueue_many(vec![NewJob::new(name, payload)]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| QueueError::Task("入队未返回任务ID".to_string()))
    }

    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, QueueError> {
        let queue = self.queue.clone();
        self.with_conn(move |conn| {
            let now = now_ms();
            let enqueued_at = Utc::now();
            let tx = conn.transaction()?;
            let mut ids = Vec::with_capacity(jobs.len());
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO jobs (queue, name, payload, run_at_ms, enqueued_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for job in jobs {
                    let payload = serde_json::to_string(&job.payload)?;
                    stmt.execute(params![queue, job.name, payload, now, enqueued_at])?;
                    ids.push(tx.last_insert_rowid() as JobId);
                }
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = instant_after(Instant::now(), wait);
        loop {
            if let Some(job) = self.try_reserve().await? {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until(instant_after(now, self.poll_interval).min(deadline)).await;
        }
    }

    async fn complete(&self, job: &Job) -> Result<bool, QueueError> {
        let (id, attempts) = (job.id, job.attempts);
        let held = self
            .with_conn(move |conn| {
                let updated = conn.execute(
                    "UPDATE jobs SET state = 'completed', lease_until_ms = NULL, finished_at = ?3
                     WHERE id = ?1 AND state = 'active' AND attempts = ?2",
                    params![id as i64, attempts, Utc::now()],
                )?;
                if updated == 0 {
                    ensure_exists(conn, id)?;
                }
                Ok(updated > 0)
            })
            .await?;

        if !held {
            debug!(job_id = id, attempts, "投递已失效，忽略完成标记");
        }
        Ok(held)
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<Option<JobState>, QueueError> {
        let (id, attempts) = (job.id, job.attempts);
        let error = error.to_string();
        let policy = self.policy;
        let state = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let held = tx
                    .query_row(
                        "SELECT 1 FROM jobs WHERE id = ?1 AND state = 'active' AND attempts = ?2",
                        params![id as i64, attempts],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if !held {
                    ensure_exists(&tx, id)?;
                    return Ok(None);
                }

                let state = match policy.retry_delay(attempts) {
                    Some(delay) => {
                        tx.execute(
                            "UPDATE jobs SET state = 'waiting', run_at_ms = ?2, lease_until_ms = NULL,
                             last_error = ?3 WHERE id = ?1",
                            params![id as i64, now_ms().saturating_add(duration_ms(delay)), error],
                        )?;
                        JobState::Waiting
                    }
                    None => {
                        tx.execute(
                            "UPDATE jobs SET state = 'failed', lease_until_ms = NULL, last_error = ?2,
                             finished_at = ?3 WHERE id = ?1",
                            params![id as i64, error, Utc::now()],
                        )?;
                        JobState::Failed
                    }
                };
                tx.commit()?;
                Ok(Some(state))
            })
            .await?;

        if state.is_none() {
            debug!(job_id = id, attempts, "投递已失效，忽略失败记录");
        }
        Ok(state)
    }

    async fn append_log(&self, id: JobId, line: &str) -> Result<(), QueueError> {
        let line = line.to_string();
        self.with_conn(move |conn| {
            ensure_exists(conn, id)?;
            conn.execute(
                "INSERT INTO job_logs (job_id, line) VALUES (?1, ?2)",
                params![id as i64, line],
            )?;
            Ok(())
        })
        .await
    }

    async fn logs(&self, id: JobId) -> Result<Vec<String>, QueueError> {
        self.with_conn(move |conn| {
            ensure_exists(conn, id)?;
            let mut stmt =
                conn.prepare_cached("SELECT line FROM job_logs WHERE job_id = ?1 ORDER BY seq")?;
            let lines = stmt
                .query_map([id as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(lines)
        })
        .await
    }

    async fn job(&self, id: JobId) -> Result<Option<JobInfo>, QueueError> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS}, state, last_error FROM jobs WHERE id = ?1"),
                    [id as i64],
                    |row| {
                        Ok((
                            raw_job_from_row(row)?,
                            row.get::<_, String>("state")?,
                            row.get::<_, Option<String>>("last_error")?,
                        ))
                    },
                )
                .optional()?;

            let Some((raw, state, last_error)) = row else {
                return Ok(None);
            };
            Ok(Some(JobInfo {
                job: job_from_raw(raw)?,
                state: state.parse().map_err(QueueError::Task)?,
                last_error,
            }))
        })
        .await
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let queue = self.queue.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state")?;
            let rows = stmt
                .query_map([queue], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut counts = QueueCounts::default();
            for (state, count) in rows {
                let state: JobState = state.parse().map_err(QueueError::Task)?;
                counts.add(state, count.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(20),
            lease: Duration::from_millis(50),
        }
    }

    fn open_queue(policy: RetryPolicy) -> SqliteWorkQueue {
        SqliteWorkQueue::open_in_memory("relay-checks", policy, Duration::from_millis(10)).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_many_preserves_order() {
        let queue = open_queue(RetryPolicy::default());
        let jobs = ["smp://c", "smp://a", "smp://b"]
            .iter()
            .map(|uri| NewJob::new(format!("schedule {uri}"), JobPayload::new(*uri)))
            .collect();
        queue.enqueue_many(jobs).await.unwrap();

        let mut delivered = Vec::new();
        while let Some(job) = queue.reserve(Duration::ZERO).await.unwrap() {
            delivered.push(job.payload.endpoint_uri);
        }
        assert_eq!(delivered, vec!["smp://c", "smp://a", "smp://b"]);
        assert_eq!(queue.counts().await.unwrap().active, 3);
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let id = {
            let queue = SqliteWorkQueue::open(
                &path,
                "relay-checks",
                RetryPolicy::default(),
                Duration::from_millis(10),
            )
            .unwrap();
            queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap()
        };

        let queue = SqliteWorkQueue::open(
            &path,
            "relay-checks",
            RetryPolicy::default(),
            Duration::from_millis(10),
        )
        .unwrap();
        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.name, "new smp://a");

        // 其他队列名互不可见
        let other = SqliteWorkQueue::open(
            &path,
            "other",
            RetryPolicy::default(),
            Duration::from_millis(10),
        )
        .unwrap();
        assert_eq!(other.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_retry_backoff_and_final_failure() {
        let queue = open_queue(quick_policy());
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&job, "store offline").await.unwrap(),
            Some(JobState::Waiting)
        );
        assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());

        let retry = queue.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(retry.attempts, 2);
        assert_eq!(
            queue.fail(&retry, "store offline").await.unwrap(),
            Some(JobState::Failed)
        );

        let info = queue.job(id).await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Failed);
        assert_eq!(info.last_error.as_deref(), Some("store offline"));
        let mut missing = retry.clone();
        missing.id = 999;
        assert!(matches!(
            queue.fail(&missing, "x").await,
            Err(QueueError::JobNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = open_queue(quick_policy());
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());

        let again = queue.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_stale_delivery_cannot_settle_job() {
        let queue = open_queue(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(20),
            lease: Duration::from_millis(30),
        });
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        let stale = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        let current = queue.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(current.attempts, 2);

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
        let queue = open_queue(RetryPolicy {
            max_attempts: 1,
            backoff: Duration::from_millis(10),
            lease: Duration::from_millis(10),
        });
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.reserve(Duration::from_millis(50)).await.unwrap().is_none());

        let info = queue.job(id).await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Failed);
        assert_eq!(info.job.attempts, 1);
        assert_eq!(info.last_error.as_deref(), Some(LEASE_EXHAUSTED_ERROR));
        assert!(!queue.complete(&job).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_failed() {
        let queue = open_queue(RetryPolicy::default());
        let conn = queue.conn.clone();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .execute(
                    "INSERT INTO jobs (queue, name, payload, run_at_ms, enqueued_at)
                     VALUES ('relay-checks', 'schedule x', '{\"serverUri\":\"x\"}', 0, ?1)",
                    [Utc::now()],
                )
                .unwrap();
        })
        .await
        .unwrap();
        queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();

        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.payload.endpoint_uri, "smp://a");
        assert_eq!(queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_job_logs() {
        let queue = open_queue(RetryPolicy::default());
        let id = queue.enqueue("new smp://a", JobPayload::new("smp://a")).await.unwrap();
        queue.append_log(id, "first").await.unwrap();
        queue.append_log(id, "second").await.unwrap();
        assert_eq!(queue.logs(id).await.unwrap(), vec!["first", "second"]);
        assert!(matches!(
            queue.logs(42).await,
            Err(QueueError::JobNotFound(42))
        ));
    }
}

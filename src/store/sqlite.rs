//! SQLite状态存储
//!
//! 单表可变记录模型：每个端点一行，检测结果原地更新。
//! 注册事件由变更监视任务轮询新插入的行后发布，
//! 因此其他进程写入的端点同样会触发事件。

use super::{EndpointRegistered, StatusStore, REGISTRATION_CHANNEL_CAPACITY};
use crate::endpoint::{EndpointRecord, StatusUpdate, UpdateOutcome};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS endpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uri TEXT NOT NULL UNIQUE,
    status INTEGER,
    status_since TEXT,
    last_check TEXT,
    country TEXT,
    info_page_available INTEGER NOT NULL DEFAULT 0,
    registered_at TEXT NOT NULL
);";

const SELECT_COLUMNS: &str =
    "SELECT uri, status, status_since, last_check, country, info_page_available, registered_at FROM endpoints";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EndpointRecord> {
    Ok(EndpointRecord {
        uri: row.get("uri")?,
        status: row.get("status")?,
        status_since: row.get("status_since")?,
        last_check: row.get("last_check")?,
        country: row.get("country")?,
        info_page_available: row.get("info_page_available")?,
        registered_at: row.get("registered_at")?,
    })
}

/// SQLite状态存储
#[derive(Clone)]
pub struct SqliteStatusStore {
    conn: Arc<Mutex<Connection>>,
    registrations: broadcast::Sender<EndpointRegistered>,
}

impl SqliteStatusStore {
    /// 打开或创建数据库文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "状态存储已打开");
        Self::init(conn)
    }

    /// 创建内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        let (registrations, _) = broadcast::channel(REGISTRATION_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            registrations,
        })
    }

    /// 在阻塞线程池中使用连接
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("数据库连接锁已失效".to_string()))?;
            f(&mut guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// 启动注册事件监视任务
    ///
    /// 只发布启动之后插入的端点。
    pub async fn spawn_registration_watcher(
        &self,
        interval: Duration,
    ) -> Result<JoinHandle<()>, StoreError> {
        let mut last_seen: i64 = self
            .with_conn(|conn| {
                conn.query_row("SELECT COALESCE(MAX(id), 0) FROM endpoints", [], |row| {
                    row.get(0)
                })
            })
            .await?;

        let store = self.clone();
        let handle = tokio::spawn(async move {
            info!("端点注册监视任务已启动，起始行: {}", last_seen);
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let since = last_seen;
                let rows = store
                    .with_conn(move |conn| {
                        let mut stmt = conn.prepare_cached(
                            "SELECT id, uri FROM endpoints WHERE id > ?1 ORDER BY id",
                        )?;
                        let rows = stmt
                            .query_map([since], |row| Ok((row.get::<_, i64>(0)?, row.get(1)?)))?
                            .collect::<rusqlite::Result<Vec<(i64, String)>>>()?;
                        Ok(rows)
                    })
                    .await;

                match rows {
                    Ok(rows) => {
                        for (id, uri) in rows {
                            debug!(uri = %uri, "检测到新注册的端点");
                            last_seen = id;
                            let _ = store.registrations.send(EndpointRegistered { uri });
                        }
                    }
                    Err(e) => warn!("轮询新注册端点失败: {}", e),
                }
            }
        });

        Ok(handle)
    }
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn get(&self, uri: &str) -> Result<Option<EndpointRecord>, StoreError> {
        let uri = uri.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE uri = ?1"),
                [uri],
                record_from_row,
            )
            .optional()
        })
        .await
    }

    async fn get_all(&self) -> Result<Vec<EndpointRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!("{SELECT_COLUMNS} ORDER BY id"))?;
            let records = stmt
                .query_map([], record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn register(&self, uri: &str) -> Result<bool, StoreError> {
        let uri = uri.to_string();
        let inserted = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO endpoints (uri, registered_at) VALUES (?1, ?2)",
                    params![uri, Utc::now()],
                )
            })
            .await?;
        Ok(inserted == 1)
    }

    async fn update(
        &self,
        uri: &str,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        let uri = uri.to_string();
        let update = update.clone();
        self.with_conn(move |conn| {
            // 读取与写入在同一写事务中完成
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = tx
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE uri = ?1"),
                    [&uri],
                    record_from_row,
                )
                .optional()?;

            let Some(mut record) = current else {
                return Ok(UpdateOutcome::Missing);
            };

            let transition = record.apply(&update, now);
            tx.execute(
                "UPDATE endpoints
                 SET status = ?2, status_since = ?3, last_check = ?4, country = ?5, info_page_available = ?6
                 WHERE uri = ?1",
                params![
                    record.uri,
                    record.status,
                    record.status_since,
                    record.last_check,
                    record.country,
                    record.info_page_available,
                ],
            )?;
            tx.commit()?;
            Ok(UpdateOutcome::Applied(transition))
        })
        .await
    }

    async fn delete(&self, uri: &str) -> Result<bool, StoreError> {
        let uri = uri.to_string();
        let deleted = self
            .with_conn(move |conn| conn.execute("DELETE FROM endpoints WHERE uri = ?1", [uri]))
            .await?;
        Ok(deleted > 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<EndpointRegistered> {
        self.registrations.subscribe()
    }
}

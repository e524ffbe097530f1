//! 状态存储模块
//!
//! 持久化每个端点的最近状态、状态变化时间和附加信息，
//! 并提供“端点已注册”事件流

pub mod memory;
pub mod sqlite;

use crate::endpoint::{EndpointRecord, StatusUpdate, UpdateOutcome};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// 重新导出主要类型
pub use memory::InMemoryStatusStore;
pub use sqlite::SqliteStatusStore;

/// 注册事件通道容量
pub const REGISTRATION_CHANNEL_CAPACITY: usize = 256;

/// 新端点注册事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRegistered {
    pub uri: String,
}

/// 状态存储trait
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// 读取单个端点记录
    async fn get(&self, uri: &str) -> Result<Option<EndpointRecord>, StoreError>;

    /// 读取全部端点记录
    async fn get_all(&self) -> Result<Vec<EndpointRecord>, StoreError>;

    /// 注册新端点，已存在时返回 `false`
    async fn register(&self, uri: &str) -> Result<bool, StoreError>;

    /// 应用一次检测结果
    ///
    /// 记录不存在时返回 [`UpdateOutcome::Missing`]，不视为错误。
    async fn update(
        &self,
        uri: &str,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError>;

    /// 删除端点记录，记录不存在时返回 `false`
    async fn delete(&self, uri: &str) -> Result<bool, StoreError>;

    /// 订阅端点注册事件
    fn subscribe(&self) -> broadcast::Receiver<EndpointRegistered>;
}

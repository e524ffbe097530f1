//! 内存状态存储
//!
//! 进程内实现，注册时直接发布注册事件

use super::{EndpointRegistered, StatusStore, REGISTRATION_CHANNEL_CAPACITY};
use crate::endpoint::{EndpointRecord, StatusUpdate, UpdateOutcome};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// 内存状态存储
#[derive(Debug)]
pub struct InMemoryStatusStore {
    /// 端点记录映射
    records: Arc<RwLock<HashMap<String, EndpointRecord>>>,
    /// 注册事件发送端
    registrations: broadcast::Sender<EndpointRegistered>,
}

impl InMemoryStatusStore {
    /// 创建空的内存存储
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    /// 使用已有记录创建，不发布注册事件
    pub fn with_records(records: Vec<EndpointRecord>) -> Self {
        let (registrations, _) = broadcast::channel(REGISTRATION_CHANNEL_CAPACITY);
        let map: HashMap<String, EndpointRecord> = records
            .into_iter()
            .map(|record| (record.uri.clone(), record))
            .collect();

        Self {
            records: Arc::new(RwLock::new(map)),
            registrations,
        }
    }
}

impl Default for InMemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get(&self, uri: &str) -> Result<Option<EndpointRecord>, StoreError> {
        Ok(self.records.read().await.get(uri).cloned())
    }

    async fn get_all(&self) -> Result<Vec<EndpointRecord>, StoreError> {
        let records = self.records.read().await;
        let mut all: Vec<EndpointRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.uri.cmp(&b.uri)));
        Ok(all)
    }

    async fn register(&self, uri: &str) -> Result<bool, StoreError> {
        {
            let mut records = self.records.write().await;
            if records.contains_key(uri) {
                return Ok(false);
            }
            records.insert(uri.to_string(), EndpointRecord::new(uri, Utc::now()));
        }

        // 没有订阅者时发送失败，可以忽略
        let _ = self.registrations.send(EndpointRegistered {
            uri: uri.to_string(),
        });
        Ok(true)
    }

    async fn update(
        &self,
        uri: &str,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(uri) {
            Some(record) => Ok(UpdateOutcome::Applied(record.apply(update, now))),
            None => Ok(UpdateOutcome::Missing),
        }
    }

    async fn delete(&self, uri: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(uri).is_some())
    }

    fn subscribe(&self) -> broadcast::Receiver<EndpointRegistered> {
        self.registrations.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Transition;
    use chrono::Duration;

    fn update(reachable: bool) -> StatusUpdate {
        StatusUpdate {
            reachable,
            country: None,
            info_page_available: false,
        }
    }

    #[tokio::test]
    async fn test_register_publishes_event_once() {
        let store = InMemoryStatusStore::new();
        let mut events = store.subscribe();

        assert!(store.register("relay://good.example.com").await.unwrap());
        assert!(!store.register("relay://good.example.com").await.unwrap());

        let event = events.recv().await.unwrap();
        assert_eq!(event.uri, "relay://good.example.com");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_twice_keeps_status_since() {
        let store = InMemoryStatusStore::new();
        store.register("relay://good.example.com").await.unwrap();

        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(1);
        store
            .update("relay://good.example.com", &update(true), t0)
            .await
            .unwrap();
        let outcome = store
            .update("relay://good.example.com", &update(true), t1)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied(Transition::Unchanged(true)));

        let record = store.get("relay://good.example.com").await.unwrap().unwrap();
        assert_eq!(record.status_since, Some(t0));
        assert_eq!(record.last_check, Some(t1));
    }

    #[tokio::test]
    async fn test_update_missing_record_is_noop() {
        let store = InMemoryStatusStore::new();
        let outcome = store
            .update("relay://gone.example.com", &update(true), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Missing);
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryStatusStore::with_records(vec![EndpointRecord::new(
            "relay://official.simplex.im",
            Utc::now(),
        )]);
        assert!(store.delete("relay://official.simplex.im").await.unwrap());
        assert!(!store.delete("relay://official.simplex.im").await.unwrap());
        assert!(store.get("relay://official.simplex.im").await.unwrap().is_none());
    }
}

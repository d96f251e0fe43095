// src/storage/mod.rs
// Persistence boundary. The real store (device preferences, cloud sync) is
// owned by an excluded layer; the core only depends on string get/put/remove.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::AppError;

pub mod write_queue;

pub use write_queue::PersistenceQueue;

/// Generic string key-value store consumed by the AI core.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn put(&self, key: &str, value: String) -> Result<(), AppError>;
    async fn remove(&self, key: &str) -> Result<(), AppError>;
}

/// Well-known keys. Schema evolution beyond these names is owned by the
/// persistence layer.
pub mod keys {
    use chrono::NaiveDate;

    pub fn active_model() -> String {
        "ai.active_model".to_string()
    }

    pub fn wallet(user_id: &str) -> String {
        format!("ai.wallet.{user_id}")
    }

    pub fn family_ledger(family_id: &str) -> String {
        format!("ai.family.{family_id}")
    }

    pub fn daily_cloud_calls(user_id: &str, date: NaiveDate) -> String {
        format!("ai.daily.{user_id}.{date}")
    }

    pub fn session_history(user_id: &str) -> String {
        format!("ai.history.{user_id}")
    }

    pub fn memories(user_id: &str) -> String {
        format!("ai.memories.{user_id}")
    }
}

/// In-process store used in tests and as the default in-memory mirror.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), AppError> {
        self.inner.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.put("k", "v".to_string()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[test]
    fn daily_key_includes_date_stamp() {
        let date = chrono::NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();
        assert_eq!(keys::daily_cloud_calls("u1", date), "ai.daily.u1.2025-06-03");
    }
}

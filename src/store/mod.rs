//! Job ledger: JSON records keyed by job id.
//!
//! The dispatch core never calls the store; the HTTP front door records
//! submissions and the result router records outcomes.

pub mod libsql_backend;
pub mod migrations;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

pub use libsql_backend::LibSqlJobStore;

/// Terminal status written once a worker result is recorded.
pub const STATUS_COMPLETED: &str = "completed";

/// Key/value persistence for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace the record under `key`.
    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Set the record's `status` unless it is already [`STATUS_COMPLETED`].
    ///
    /// Returns false when the record is missing or already completed.
    async fn update_status(&self, key: &str, status: &str) -> Result<bool, StoreError>;
}

/// Non-persistent [`JobStore`] for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<String, Value>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(key.to_string(), value);
        Ok(())
    }

    async fn update_status(&self, key: &str, status: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let Some(fields) = records.get_mut(key).and_then(Value::as_object_mut) else {
            return Ok(false);
        };
        if fields.get("status").and_then(Value::as_str) == Some(STATUS_COMPLETED) {
            return Ok(false);
        }
        fields.insert("status".to_string(), Value::from(status));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryJobStore::new();
        assert!(store.get("job-1").await.unwrap().is_none());

        store.put("job-1", json!({"text": "hi"})).await.unwrap();
        store.put("job-1", json!({"text": "bye"})).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("job-1").await.unwrap().unwrap()["text"], "bye");
    }

    #[tokio::test]
    async fn status_update_never_reopens_completed_record() {
        let store = MemoryJobStore::new();
        assert!(!store.update_status("job-1", "submitted").await.unwrap());

        store.put("job-1", json!({"status": "pending"})).await.unwrap();
        assert!(store.update_status("job-1", "submitted").await.unwrap());
        assert_eq!(store.get("job-1").await.unwrap().unwrap()["status"], "submitted");

        store
            .put("job-1", json!({"status": "completed", "result": {"cdnLink": "x"}}))
            .await
            .unwrap();
        assert!(!store.update_status("job-1", "queued").await.unwrap());
        let record = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(record["status"], "completed");
        assert_eq!(record["result"]["cdnLink"], "x");
    }
}

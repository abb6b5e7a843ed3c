//! Result persistence
//!
//! Task and flow return values are stored out of band and referenced from
//! Completed states by [`ResultRef`].

use crate::error::{Result, TrackerError};
use async_trait::async_trait;
use conflux_types::ResultRef;
use dashmap::DashMap;
use serde_json::Value;

/// Storage for run return values
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, key: ResultRef, value: Value) -> Result<()>;

    async fn get(&self, key: &ResultRef) -> Result<Option<Value>>;
}

/// In-memory result store
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    values: DashMap<ResultRef, Value>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, key: ResultRef, value: Value) -> Result<()> {
        if let Some(existing) = self.values.get(&key) {
            if *existing != value {
                return Err(TrackerError::Storage(format!(
                    "result {} already stored with a different value",
                    key
                )));
            }
            return Ok(());
        }
        self.values.insert(key, value);
        Ok(())
    }

    async fn get(&self, key: &ResultRef) -> Result<Option<Value>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryResultStore::new();
        let key = ResultRef::new("result/a");
        store.put(key.clone(), json!({"rows": 3})).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(json!({"rows": 3})));
        assert_eq!(store.get(&ResultRef::new("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_results_are_write_once() {
        let store = InMemoryResultStore::new();
        let key = ResultRef::new("result/a");
        store.put(key.clone(), json!(1)).await.unwrap();
        store.put(key.clone(), json!(1)).await.unwrap();
        assert!(store.put(key, json!(2)).await.is_err());
    }
}

//! In-memory storage backend

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{BatchWriter, DocumentQuery, QueryableBackend, StorageBackend};
use crate::error::PersistResult;

/// Process-local backend; supports every optional capability
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    documents: RwLock<BTreeMap<String, Value>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> PersistResult<Option<Value>> {
        Ok(self.documents.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> PersistResult<()> {
        self.documents.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> PersistResult<bool> {
        Ok(self.documents.write().remove(key).is_some())
    }

    async fn list_prefix(&self, prefix: &str) -> PersistResult<Vec<String>> {
        Ok(self
            .documents
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn as_queryable(&self) -> Option<&dyn QueryableBackend> {
        Some(self)
    }

    fn as_batch_writer(&self) -> Option<&dyn BatchWriter> {
        Some(self)
    }
}

impl InMemoryBackend {
    fn filtered(&self, query: &DocumentQuery) -> Vec<(String, Value)> {
        self.documents
            .read()
            .range(query.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&query.prefix))
            .filter(|(_, v)| query.matches(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl QueryableBackend for InMemoryBackend {
    async fn query(&self, query: &DocumentQuery) -> PersistResult<Vec<(String, Value)>> {
        Ok(query.finish(self.filtered(query)))
    }

    async fn count(&self, query: &DocumentQuery) -> PersistResult<usize> {
        Ok(self.filtered(query).len())
    }
}

#[async_trait]
impl BatchWriter for InMemoryBackend {
    async fn set_many(&self, entries: Vec<(String, Value)>) -> PersistResult<()> {
        let mut documents = self.documents.write();
        for (key, value) in entries {
            documents.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_set_delete() {
        let backend = InMemoryBackend::new();
        backend.set("states/g1", json!({"round": 1})).await.unwrap();

        assert_eq!(backend.get("states/g1").await.unwrap(), Some(json!({"round": 1})));
        assert!(backend.delete("states/g1").await.unwrap());
        assert!(!backend.delete("states/g1").await.unwrap());
        assert!(backend.get("states/g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_is_sorted_and_bounded() {
        let backend = InMemoryBackend::new();
        for key in ["events/g1/2", "events/g1/1", "events/g10/1", "events/g2/1"] {
            backend.set(key, json!({})).await.unwrap();
        }

        let keys = backend.list_prefix("events/g1/").await.unwrap();
        assert_eq!(keys, vec!["events/g1/1", "events/g1/2"]);
    }

    #[tokio::test]
    async fn test_capabilities() {
        let backend = InMemoryBackend::new();
        let batch = backend.as_batch_writer().unwrap();
        batch
            .set_many(vec![
                ("s/a".to_string(), json!({"phase": "lobby", "n": 2})),
                ("s/b".to_string(), json!({"phase": "playing", "n": 1})),
                ("s/c".to_string(), json!({"phase": "playing", "n": 3})),
            ])
            .await
            .unwrap();

        let queryable = backend.as_queryable().unwrap();
        let query = DocumentQuery::prefix("s/")
            .filter("phase", json!("playing"))
            .sort_by("n", true);
        let results = queryable.query(&query).await.unwrap();
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["s/c", "s/b"]);
        assert_eq!(queryable.count(&query).await.unwrap(), 2);
    }
}

//! Pluggable key/value storage backends
//!
//! Every backend supports key-addressed get/set/delete and listing by
//! prefix. Optional capabilities are separate traits that a backend either
//! implements fully or not at all:
//!
//! - [`QueryableBackend`]: filter / sort / count over stored documents
//! - [`BatchWriter`]: write many documents in one call
//!
//! Callers ask for a capability once through `as_queryable()` /
//! `as_batch_writer()` instead of testing individual methods.

mod file;
mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PersistResult;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

/// Key-addressed document storage
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> PersistResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> PersistResult<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> PersistResult<bool>;

    /// All keys starting with `prefix`, sorted
    async fn list_prefix(&self, prefix: &str) -> PersistResult<Vec<String>>;

    fn as_queryable(&self) -> Option<&dyn QueryableBackend> {
        None
    }

    fn as_batch_writer(&self) -> Option<&dyn BatchWriter> {
        None
    }
}

/// Backends that can filter, sort and count documents themselves
#[async_trait]
pub trait QueryableBackend: Send + Sync {
    async fn query(&self, query: &DocumentQuery) -> PersistResult<Vec<(String, Value)>>;

    async fn count(&self, query: &DocumentQuery) -> PersistResult<usize>;
}

/// Backends that can persist several documents in one operation
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn set_many(&self, entries: Vec<(String, Value)>) -> PersistResult<()>;
}

/// A filter/sort/paginate request over documents under a key prefix
#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    pub prefix: String,
    /// Top-level field equality filters
    pub filters: Vec<(String, Value)>,
    /// Top-level field to sort by; documents missing it sort first
    pub sort_by: Option<String>,
    pub descending: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl DocumentQuery {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push((field.into(), value));
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.sort_by = Some(field.into());
        self.descending = descending;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Whether a document passes every filter
    pub fn matches(&self, document: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }

    /// Sort and paginate already-filtered documents
    pub fn finish(&self, mut documents: Vec<(String, Value)>) -> Vec<(String, Value)> {
        if let Some(field) = &self.sort_by {
            documents.sort_by(|(_, a), (_, b)| compare_values(a.get(field), b.get(field)));
            if self.descending {
                documents.reverse();
            }
        }

        documents
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

//! Transition store trait and the in-memory implementation

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::query::{TransitionQuery, TransitionRecord};
use crate::error::PersistResult;

/// Append-only home for transition records
#[async_trait]
pub trait TransitionStore: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, record: &TransitionRecord) -> PersistResult<()>;

    /// Every record of a state machine, in sequence order
    async fn load(&self, state_machine_id: &str) -> PersistResult<Vec<TransitionRecord>>;

    async fn query(
        &self,
        state_machine_id: &str,
        query: &TransitionQuery,
    ) -> PersistResult<Vec<TransitionRecord>> {
        Ok(query.apply(self.load(state_machine_id).await?))
    }

    /// Highest sequence stored, 0 when empty
    async fn last_sequence(&self, state_machine_id: &str) -> PersistResult<u64> {
        Ok(self
            .load(state_machine_id)
            .await?
            .last()
            .map(|r| r.sequence)
            .unwrap_or(0))
    }

    /// Drop the leading run of records whose transition is older than `before`
    async fn compact(&self, state_machine_id: &str, before: DateTime<Utc>) -> PersistResult<usize>;

    async fn delete_all(&self, state_machine_id: &str) -> PersistResult<usize>;

    async fn list_ids(&self) -> PersistResult<Vec<String>>;
}

/// Length of the leading run of records older than `before`
pub(crate) fn compactable_prefix(records: &[TransitionRecord], before: DateTime<Utc>) -> usize {
    records
        .iter()
        .take_while(|r| r.transition.timestamp < before)
        .count()
}

/// Process-local transition store
#[derive(Debug, Default)]
pub struct InMemoryTransitionStore {
    records: RwLock<HashMap<String, Vec<TransitionRecord>>>,
}

impl InMemoryTransitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransitionStore for InMemoryTransitionStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, record: &TransitionRecord) -> PersistResult<()> {
        self.records
            .write()
            .entry(record.state_machine_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn load(&self, state_machine_id: &str) -> PersistResult<Vec<TransitionRecord>> {
        Ok(self
            .records
            .read()
            .get(state_machine_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn compact(&self, state_machine_id: &str, before: DateTime<Utc>) -> PersistResult<usize> {
        let mut records = self.records.write();
        let Some(entries) = records.get_mut(state_machine_id) else {
            return Ok(0);
        };
        let removable = compactable_prefix(entries, before);
        entries.drain(..removable);
        Ok(removable)
    }

    async fn delete_all(&self, state_machine_id: &str) -> PersistResult<usize> {
        Ok(self
            .records
            .write()
            .remove(state_machine_id)
            .map(|entries| entries.len())
            .unwrap_or(0))
    }

    async fn list_ids(&self) -> PersistResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .records
            .read()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

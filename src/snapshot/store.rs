//! Snapshot store trait and the in-memory implementation

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::PersistResult;
use crate::types::SnapshotMetadata;

/// Durable home for encoded snapshot bodies and their metadata
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    fn name(&self) -> &str;

    /// Persist a body; returns the id it is stored under
    async fn save(&self, metadata: &SnapshotMetadata, body: &[u8]) -> PersistResult<String>;

    async fn load(
        &self,
        state_machine_id: &str,
        snapshot_id: &str,
    ) -> PersistResult<Option<(SnapshotMetadata, Vec<u8>)>>;

    /// Metadata of every stored snapshot, oldest first
    async fn list(&self, state_machine_id: &str) -> PersistResult<Vec<SnapshotMetadata>>;

    async fn delete(&self, state_machine_id: &str, snapshot_id: &str) -> PersistResult<bool>;
}

/// Orders metadata oldest first, breaking timestamp ties by creation ordinal
pub(crate) fn sort_oldest_first(snapshots: &mut [SnapshotMetadata]) {
    snapshots.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.ordinal.cmp(&b.ordinal))
            .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
    });
}

/// Process-local snapshot store
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Vec<(SnapshotMetadata, Vec<u8>)>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored body in place
    pub fn replace_body(&self, state_machine_id: &str, snapshot_id: &str, body: Vec<u8>) -> bool {
        let mut snapshots = self.snapshots.write();
        match snapshots
            .get_mut(state_machine_id)
            .and_then(|entries| entries.iter_mut().find(|(m, _)| m.snapshot_id == snapshot_id))
        {
            Some(entry) => {
                entry.1 = body;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, metadata: &SnapshotMetadata, body: &[u8]) -> PersistResult<String> {
        let mut snapshots = self.snapshots.write();
        let entries = snapshots.entry(metadata.state_machine_id.clone()).or_default();
        entries.retain(|(m, _)| m.snapshot_id != metadata.snapshot_id);
        entries.push((metadata.clone(), body.to_vec()));
        Ok(metadata.snapshot_id.clone())
    }

    async fn load(
        &self,
        state_machine_id: &str,
        snapshot_id: &str,
    ) -> PersistResult<Option<(SnapshotMetadata, Vec<u8>)>> {
        Ok(self.snapshots.read().get(state_machine_id).and_then(|entries| {
            entries
                .iter()
                .find(|(m, _)| m.snapshot_id == snapshot_id)
                .cloned()
        }))
    }

    async fn list(&self, state_machine_id: &str) -> PersistResult<Vec<SnapshotMetadata>> {
        let mut listed: Vec<SnapshotMetadata> = self
            .snapshots
            .read()
            .get(state_machine_id)
            .map(|entries| entries.iter().map(|(m, _)| m.clone()).collect())
            .unwrap_or_default();
        sort_oldest_first(&mut listed);
        Ok(listed)
    }

    async fn delete(&self, state_machine_id: &str, snapshot_id: &str) -> PersistResult<bool> {
        let mut snapshots = self.snapshots.write();
        let Some(entries) = snapshots.get_mut(state_machine_id) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|(m, _)| m.snapshot_id != snapshot_id);
        Ok(entries.len() != before)
    }
}

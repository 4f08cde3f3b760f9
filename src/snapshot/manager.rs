//! Snapshot Manager
//!
//! Creates snapshots on every configured store, restores from the first
//! store that has one, and enforces per-state-machine retention.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;

use super::codec::{decode_state, encode_state};
use super::store::{sort_oldest_first, SnapshotStore};
use crate::config::SnapshotConfig;
use crate::error::{PersistError, PersistResult};
use crate::types::{PersistedState, RecoveryPoint, SnapshotMetadata};
use crate::utils::{system_clock, to_chrono, Clock};

/// Snapshot Manager fans snapshots out to one or more stores
pub struct SnapshotManager {
    stores: Vec<Arc<dyn SnapshotStore>>,
    config: SnapshotConfig,
    clock: Arc<dyn Clock>,
    last_snapshot: Mutex<HashMap<String, DateTime<Utc>>>,
    ordinals: Mutex<HashMap<String, u64>>,
}

impl SnapshotManager {
    pub fn new(stores: Vec<Arc<dyn SnapshotStore>>, config: SnapshotConfig) -> Self {
        Self {
            stores,
            config,
            clock: system_clock(),
            last_snapshot: Mutex::new(HashMap::new()),
            ordinals: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Snapshot `state` on every store, then apply retention
    ///
    /// Returns the ids written by the stores that succeeded. Fails only
    /// when no store accepted the snapshot.
    pub async fn create_snapshot(
        &self,
        state_machine_id: &str,
        state: &PersistedState,
        tags: Vec<String>,
    ) -> PersistResult<Vec<String>> {
        if self.stores.is_empty() {
            return Err(PersistError::Configuration(
                "snapshot manager has no stores".to_string(),
            ));
        }

        let encoded = encode_state(state, self.config.compress, self.config.compression_threshold)?;
        let ordinal = self.next_ordinal(state_machine_id).await?;
        let created_at = self.clock.now();
        let metadata = SnapshotMetadata {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            state_machine_id: state_machine_id.to_string(),
            version: state.version.clone(),
            created_at,
            size_bytes: encoded.body.len() as u64,
            compressed: encoded.compressed,
            checksum: encoded.checksum.clone(),
            transition_count: state.transitions.len(),
            tags,
            ordinal,
            sequence_number: state.sequence_number(),
        };

        let results = join_all(
            self.stores
                .iter()
                .map(|store| store.save(&metadata, &encoded.body)),
        )
        .await;

        let mut saved = Vec::new();
        let mut last_error = None;
        for (store, result) in self.stores.iter().zip(results) {
            match result {
                Ok(id) => saved.push(id),
                Err(e) => {
                    tracing::warn!(
                        store = store.name(),
                        state_machine_id = %state_machine_id,
                        error = %e,
                        "Snapshot store rejected snapshot"
                    );
                    last_error = Some(e);
                }
            }
        }

        if saved.is_empty() {
            return Err(last_error.unwrap_or_else(|| PersistError::storage("no snapshot store succeeded")));
        }

        self.last_snapshot
            .lock()
            .insert(state_machine_id.to_string(), created_at);

        tracing::info!(
            state_machine_id = %state_machine_id,
            snapshot_id = %metadata.snapshot_id,
            size_bytes = metadata.size_bytes,
            compressed = metadata.compressed,
            stores = saved.len(),
            "Created snapshot"
        );

        self.enforce_retention(state_machine_id).await?;
        Ok(saved)
    }

    /// One past the highest ordinal known for the id
    ///
    /// The stores are only consulted the first time an id is seen.
    async fn next_ordinal(&self, state_machine_id: &str) -> PersistResult<u64> {
        let known = self.ordinals.lock().get(state_machine_id).copied();
        let floor = match known {
            Some(ordinal) => ordinal,
            None => self
                .list_metadata(state_machine_id)
                .await?
                .iter()
                .map(|m| m.ordinal)
                .max()
                .unwrap_or(0),
        };

        let mut ordinals = self.ordinals.lock();
        let next = ordinals.get(state_machine_id).copied().unwrap_or(0).max(floor) + 1;
        ordinals.insert(state_machine_id.to_string(), next);
        Ok(next)
    }

    /// Load and verify a snapshot together with its metadata
    ///
    /// With no `snapshot_id` the newest snapshot is used. Stores are tried
    /// in order; a store that errors is skipped, but a checksum mismatch
    /// aborts the restore.
    pub async fn load_snapshot(
        &self,
        state_machine_id: &str,
        snapshot_id: Option<&str>,
    ) -> PersistResult<Option<(SnapshotMetadata, PersistedState)>> {
        for store in &self.stores {
            match self.load_from(store.as_ref(), state_machine_id, snapshot_id).await {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {}
                Err(e) if e.is_corruption() => {
                    tracing::error!(
                        store = store.name(),
                        state_machine_id = %state_machine_id,
                        error = %e,
                        "Snapshot failed integrity check"
                    );
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        store = store.name(),
                        state_machine_id = %state_machine_id,
                        error = %e,
                        "Snapshot store failed, trying next"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn load_from(
        &self,
        store: &dyn SnapshotStore,
        state_machine_id: &str,
        snapshot_id: Option<&str>,
    ) -> PersistResult<Option<(SnapshotMetadata, PersistedState)>> {
        let snapshot_id = match snapshot_id {
            Some(id) => id.to_string(),
            None => match store.list(state_machine_id).await?.pop() {
                Some(latest) => latest.snapshot_id,
                None => return Ok(None),
            },
        };

        let Some((metadata, body)) = store.load(state_machine_id, &snapshot_id).await? else {
            return Ok(None);
        };
        let state = decode_state(&metadata, &body)?;
        Ok(Some((metadata, state)))
    }

    pub async fn restore_snapshot(
        &self,
        state_machine_id: &str,
        snapshot_id: Option<&str>,
    ) -> PersistResult<Option<PersistedState>> {
        Ok(self
            .load_snapshot(state_machine_id, snapshot_id)
            .await?
            .map(|(_, state)| state))
    }

    /// Metadata across all stores, deduplicated by id, newest first
    pub async fn list_metadata(&self, state_machine_id: &str) -> PersistResult<Vec<SnapshotMetadata>> {
        let mut merged: Vec<SnapshotMetadata> = Vec::new();
        for store in &self.stores {
            match store.list(state_machine_id).await {
                Ok(listed) => {
                    for metadata in listed {
                        if !merged.iter().any(|m| m.snapshot_id == metadata.snapshot_id) {
                            merged.push(metadata);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(store = store.name(), error = %e, "Failed to list snapshots");
                }
            }
        }
        sort_oldest_first(&mut merged);
        merged.reverse();
        Ok(merged)
    }

    /// Snapshots as recovery points, newest first
    pub async fn list_snapshots(
        &self,
        state_machine_id: &str,
        limit: Option<usize>,
    ) -> PersistResult<Vec<RecoveryPoint>> {
        Ok(self
            .list_metadata(state_machine_id)
            .await?
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(SnapshotMetadata::to_recovery_point)
            .collect())
    }

    pub async fn latest_metadata(&self, state_machine_id: &str) -> PersistResult<Option<SnapshotMetadata>> {
        Ok(self.list_metadata(state_machine_id).await?.into_iter().next())
    }

    /// Newest snapshot taken at or before `at`
    pub async fn metadata_at_or_before(
        &self,
        state_machine_id: &str,
        at: DateTime<Utc>,
    ) -> PersistResult<Option<SnapshotMetadata>> {
        Ok(self
            .list_metadata(state_machine_id)
            .await?
            .into_iter()
            .find(|m| m.created_at <= at))
    }

    /// Newest usable snapshot whose covered sequence lies in `floor..=target`
    ///
    /// Snapshots without a sequence number never qualify. A candidate that
    /// fails to load is logged and the next older one is tried.
    pub async fn load_covering(
        &self,
        state_machine_id: &str,
        floor: u64,
        target: u64,
    ) -> PersistResult<Option<(SnapshotMetadata, PersistedState)>> {
        let floor = floor.min(target);
        for metadata in self.list_metadata(state_machine_id).await? {
            match metadata.sequence_number {
                Some(sequence) if sequence >= floor && sequence <= target => {}
                _ => continue,
            }
            match self.load_snapshot(state_machine_id, Some(&metadata.snapshot_id)).await {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        state_machine_id = %state_machine_id,
                        snapshot_id = %metadata.snapshot_id,
                        error = %e,
                        "Skipping unusable covering snapshot"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Delete a snapshot from every store; true if any store had it
    pub async fn delete_snapshot(&self, state_machine_id: &str, snapshot_id: &str) -> PersistResult<bool> {
        let mut deleted = false;
        for store in &self.stores {
            deleted |= store.delete(state_machine_id, snapshot_id).await?;
        }
        Ok(deleted)
    }

    /// Whether the policy calls for a new snapshot now
    ///
    /// Major transitions always qualify when configured; otherwise the
    /// snapshot interval must have elapsed since the last snapshot.
    pub fn should_snapshot(&self, state_machine_id: &str, is_major: bool) -> bool {
        if is_major && self.config.snapshot_on_major_transition {
            return true;
        }
        match self.last_snapshot.lock().get(state_machine_id) {
            None => true,
            Some(last) => self.clock.now() - *last >= to_chrono(self.config.snapshot_interval),
        }
    }

    /// Evict snapshots beyond `max_snapshots` or older than the retention period
    ///
    /// The newest snapshot of each store is never evicted by age. Returns
    /// the number of snapshots removed.
    pub async fn enforce_retention(&self, state_machine_id: &str) -> PersistResult<usize> {
        let now = self.clock.now();
        let mut removed = 0;

        for store in &self.stores {
            let mut listed = match store.list(state_machine_id).await {
                Ok(listed) => listed,
                Err(e) => {
                    tracing::warn!(store = store.name(), error = %e, "Skipping retention for store");
                    continue;
                }
            };
            listed.reverse();

            for (index, metadata) in listed.iter().enumerate() {
                let over_cap = index >= self.config.max_snapshots;
                let expired = index > 0
                    && self
                        .config
                        .retention_period
                        .map(|period| now - metadata.created_at > to_chrono(period))
                        .unwrap_or(false);

                if (over_cap || expired) && store.delete(state_machine_id, &metadata.snapshot_id).await? {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::debug!(state_machine_id = %state_machine_id, removed, "Evicted old snapshots");
        }
        Ok(removed)
    }

    /// Forget the in-process snapshot timestamp of a state machine
    pub fn forget(&self, state_machine_id: &str) {
        self.last_snapshot.lock().remove(state_machine_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::InMemorySnapshotStore;
    use crate::utils::FakeClock;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    struct FailingStore;

    #[async_trait]
    impl SnapshotStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }
        async fn save(&self, _: &SnapshotMetadata, _: &[u8]) -> PersistResult<String> {
            Err(PersistError::storage("disk full"))
        }
        async fn load(&self, _: &str, _: &str) -> PersistResult<Option<(SnapshotMetadata, Vec<u8>)>> {
            Err(PersistError::storage("disk gone"))
        }
        async fn list(&self, _: &str) -> PersistResult<Vec<SnapshotMetadata>> {
            Err(PersistError::storage("disk gone"))
        }
        async fn delete(&self, _: &str, _: &str) -> PersistResult<bool> {
            Ok(false)
        }
    }

    fn state(round: i64) -> PersistedState {
        let mut state = PersistedState::new("g1");
        state.current_state = "playing".to_string();
        state.state_data.insert("round".to_string(), json!(round));
        state
    }

    fn manager(config: SnapshotConfig, clock: &FakeClock) -> (SnapshotManager, Arc<InMemorySnapshotStore>) {
        let store = Arc::new(InMemorySnapshotStore::new());
        let manager = SnapshotManager::new(vec![store.clone()], config).with_clock(Arc::new(clock.clone()));
        (manager, store)
    }

    #[tokio::test]
    async fn test_create_and_restore_latest() {
        let clock = FakeClock::new();
        let (manager, _) = manager(SnapshotConfig::default(), &clock);

        manager.create_snapshot("g1", &state(1), vec![]).await.unwrap();
        clock.advance(Duration::seconds(1));
        let ids = manager.create_snapshot("g1", &state(2), vec!["major".into()]).await.unwrap();
        assert_eq!(ids.len(), 1);

        let restored = manager.restore_snapshot("g1", None).await.unwrap().unwrap();
        assert_eq!(restored.get("round"), Some(&json!(2)));

        let points = manager.list_snapshots("g1", Some(1)).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].recovery_id, ids[0]);

        let latest = manager.latest_metadata("g1").await.unwrap().unwrap();
        assert_eq!(latest.snapshot_id, ids[0]);
        assert_eq!(latest.tags, vec!["major".to_string()]);
        assert!(manager.restore_snapshot("nobody", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retention_keeps_most_recent() {
        let clock = FakeClock::new();
        let config = SnapshotConfig {
            max_snapshots: 3,
            ..Default::default()
        };
        let (manager, _) = manager(config, &clock);

        for round in 1..=5 {
            manager.create_snapshot("g1", &state(round), vec![]).await.unwrap();
            clock.advance(Duration::seconds(1));
        }

        let listed = manager.list_metadata("g1").await.unwrap();
        assert_eq!(listed.len(), 3);
        let newest = manager.restore_snapshot("g1", None).await.unwrap().unwrap();
        assert_eq!(newest.get("round"), Some(&json!(5)));
        let oldest_kept = manager
            .restore_snapshot("g1", Some(&listed[2].snapshot_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(oldest_kept.get("round"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_creation_order() {
        let clock = FakeClock::new();
        let config = SnapshotConfig {
            max_snapshots: 3,
            ..Default::default()
        };
        let (manager, store) = manager(config, &clock);

        // The clock never moves, so only the ordinal separates them
        for round in 1..=5 {
            manager.create_snapshot("g1", &state(round), vec![]).await.unwrap();
        }

        let newest = manager.restore_snapshot("g1", None).await.unwrap().unwrap();
        assert_eq!(newest.get("round"), Some(&json!(5)));

        let ordinals: Vec<u64> = manager
            .list_metadata("g1")
            .await
            .unwrap()
            .iter()
            .map(|m| m.ordinal)
            .collect();
        assert_eq!(ordinals, vec![5, 4, 3]);

        // A fresh manager continues after the stored ordinals
        let reopened = SnapshotManager::new(vec![store], SnapshotConfig::default()).with_clock(Arc::new(clock.clone()));
        reopened.create_snapshot("g1", &state(6), vec![]).await.unwrap();
        let latest = reopened.latest_metadata("g1").await.unwrap().unwrap();
        assert_eq!(latest.ordinal, 6);
        let restored = reopened.restore_snapshot("g1", None).await.unwrap().unwrap();
        assert_eq!(restored.get("round"), Some(&json!(6)));
    }

    #[tokio::test]
    async fn test_load_covering_picks_newest_in_range() {
        let clock = FakeClock::new();
        let (manager, _) = manager(SnapshotConfig::default(), &clock);

        manager.create_snapshot("g1", &state(0), vec![]).await.unwrap();
        for (round, sequence) in [(1, 4u64), (2, 8), (3, 12)] {
            clock.advance(Duration::seconds(1));
            let mut covered = state(round);
            covered.set_sequence_number(sequence);
            manager.create_snapshot("g1", &covered, vec![]).await.unwrap();
        }

        let (metadata, found) = manager.load_covering("g1", 4, 10).await.unwrap().unwrap();
        assert_eq!(metadata.sequence_number, Some(8));
        assert_eq!(found.get("round"), Some(&json!(2)));

        let (metadata, _) = manager.load_covering("g1", 4, 20).await.unwrap().unwrap();
        assert_eq!(metadata.sequence_number, Some(12));

        assert!(manager.load_covering("g1", 9, 11).await.unwrap().is_none());
        assert!(manager.load_covering("g1", 1, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retention_period_spares_newest() {
        let clock = FakeClock::new();
        let config = SnapshotConfig {
            retention_period: Some(StdDuration::from_secs(60)),
            ..Default::default()
        };
        let (manager, _) = manager(config, &clock);

        manager.create_snapshot("g1", &state(1), vec![]).await.unwrap();
        clock.advance(Duration::seconds(30));
        manager.create_snapshot("g1", &state(2), vec![]).await.unwrap();
        clock.advance(Duration::minutes(10));

        assert_eq!(manager.enforce_retention("g1").await.unwrap(), 1);
        assert_eq!(manager.list_metadata("g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_is_hard_failure() {
        let clock = FakeClock::new();
        let (manager, store) = manager(
            SnapshotConfig {
                compress: false,
                ..Default::default()
            },
            &clock,
        );
        let ids = manager.create_snapshot("g1", &state(1), vec![]).await.unwrap();

        let (_, mut body) = store.load("g1", &ids[0]).await.unwrap().unwrap();
        body[3] ^= 0x01;
        store.replace_body("g1", &ids[0], body);

        let err = manager.restore_snapshot("g1", None).await.unwrap_err();
        assert!(matches!(err, PersistError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_failing_store_falls_through() {
        let memory = Arc::new(InMemorySnapshotStore::new());
        let manager = SnapshotManager::new(
            vec![Arc::new(FailingStore), memory.clone()],
            SnapshotConfig::default(),
        );

        let ids = manager.create_snapshot("g1", &state(4), vec![]).await.unwrap();
        assert_eq!(ids.len(), 1);

        let restored = manager.restore_snapshot("g1", None).await.unwrap().unwrap();
        assert_eq!(restored.get("round"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_should_snapshot_policy() {
        let clock = FakeClock::new();
        let config = SnapshotConfig {
            snapshot_interval: StdDuration::from_secs(300),
            ..Default::default()
        };
        let (manager, _) = manager(config, &clock);

        assert!(manager.should_snapshot("g1", false));
        manager.create_snapshot("g1", &state(1), vec![]).await.unwrap();
        assert!(!manager.should_snapshot("g1", false));
        assert!(manager.should_snapshot("g1", true));

        clock.advance(Duration::minutes(5));
        assert!(manager.should_snapshot("g1", false));
    }
}

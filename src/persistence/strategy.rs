//! Persistence strategies
//!
//! The manager holds exactly one `Arc<dyn PersistenceStrategy>`, chosen
//! when it is built.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::StrategyKind;
use crate::error::{PersistError, PersistResult};
use crate::event_store::{EventStore, REPLACE_STATE};
use crate::snapshot::SnapshotManager;
use crate::types::{EventType, PersistedState, StateData, StateTransition, StateVersion};
use crate::utils::{system_clock, to_chrono, Clock};
use crate::versioning::StateVersionManager;

/// One way of storing and loading state
#[async_trait]
pub trait PersistenceStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Whether an unforced save should hit storage now
    fn should_persist(&self, _state_machine_id: &str) -> bool {
        true
    }

    /// Persist `state`; returns a save id
    async fn save(&self, state_machine_id: &str, state: &PersistedState) -> PersistResult<String>;

    /// Persist `state` under an explicit version
    async fn save_version(
        &self,
        state_machine_id: &str,
        state: &PersistedState,
        version: StateVersion,
    ) -> PersistResult<String> {
        let mut state = state.clone();
        state.version = version;
        self.save(state_machine_id, &state).await
    }

    /// Persist several states; one result per entry, in order
    async fn save_batch(&self, batch: &[(String, PersistedState)]) -> Vec<PersistResult<String>> {
        let mut results = Vec::with_capacity(batch.len());
        for (state_machine_id, state) in batch {
            results.push(self.save(state_machine_id, state).await);
        }
        results
    }

    async fn load(&self, state_machine_id: &str, version: Option<&StateVersion>) -> PersistResult<Option<PersistedState>>;

    async fn delete(&self, state_machine_id: &str) -> PersistResult<bool>;

    /// Stored versions, oldest first
    async fn list_versions(&self, state_machine_id: &str) -> PersistResult<Vec<StateVersion>>;

    /// Record a transition in the strategy's own log, if it keeps one
    async fn record_transition(&self, _state_machine_id: &str, _transition: &StateTransition) -> PersistResult<()> {
        Ok(())
    }
}

/// Whole-state snapshots, rate limited per state machine
pub struct SnapshotOnlyStrategy {
    snapshots: Arc<SnapshotManager>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    last_saved: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SnapshotOnlyStrategy {
    pub fn new(snapshots: Arc<SnapshotManager>, interval: Duration) -> Self {
        Self {
            snapshots,
            interval,
            clock: system_clock(),
            last_saved: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl PersistenceStrategy for SnapshotOnlyStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SnapshotOnly
    }

    fn should_persist(&self, state_machine_id: &str) -> bool {
        match self.last_saved.lock().get(state_machine_id) {
            None => true,
            Some(last) => self.clock.now() - *last >= to_chrono(self.interval),
        }
    }

    async fn save(&self, state_machine_id: &str, state: &PersistedState) -> PersistResult<String> {
        let tags = vec![format!("version:{}", state.version)];
        let ids = self.snapshots.create_snapshot(state_machine_id, state, tags).await?;
        self.last_saved
            .lock()
            .insert(state_machine_id.to_string(), self.clock.now());
        Ok(ids.into_iter().next().unwrap_or_default())
    }

    async fn load(&self, state_machine_id: &str, version: Option<&StateVersion>) -> PersistResult<Option<PersistedState>> {
        let Some(version) = version else {
            return self.snapshots.restore_snapshot(state_machine_id, None).await;
        };
        let matching = self
            .snapshots
            .list_metadata(state_machine_id)
            .await?
            .into_iter()
            .find(|m| &m.version == version);
        match matching {
            Some(metadata) => {
                self.snapshots
                    .restore_snapshot(state_machine_id, Some(&metadata.snapshot_id))
                    .await
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, state_machine_id: &str) -> PersistResult<bool> {
        let mut deleted = false;
        for metadata in self.snapshots.list_metadata(state_machine_id).await? {
            deleted |= self
                .snapshots
                .delete_snapshot(state_machine_id, &metadata.snapshot_id)
                .await?;
        }
        self.snapshots.forget(state_machine_id);
        self.last_saved.lock().remove(state_machine_id);
        Ok(deleted)
    }

    async fn list_versions(&self, state_machine_id: &str) -> PersistResult<Vec<StateVersion>> {
        let mut versions: Vec<StateVersion> = self
            .snapshots
            .list_metadata(state_machine_id)
            .await?
            .into_iter()
            .map(|m| m.version)
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }
}

/// Appends a `Created` or `Updated` event carrying the whole state
///
/// The event replaces the projected state, so keys the caller dropped stay
/// dropped. Save ids are `<id>:<sequence>` and versions are `0.0.<sequence>`.
async fn append_state_event(
    events: &EventStore,
    state_machine_id: &str,
    state: &PersistedState,
) -> PersistResult<u64> {
    let version = events.stream_version(state_machine_id).await?;
    let starts_fresh = version == 0
        || events
            .get_events(state_machine_id, version - 1, None)
            .await?
            .last()
            .map(|e| e.event_type == EventType::Deleted)
            .unwrap_or(true);
    let event_type = if starts_fresh {
        EventType::Created
    } else {
        EventType::Updated
    };

    let mut metadata = StateData::new();
    metadata.insert(REPLACE_STATE.to_string(), Value::Bool(true));
    let actor = state.metadata.get("actor_id").and_then(Value::as_str);
    let event = events
        .append_with_metadata(
            state_machine_id,
            event_type,
            serde_json::to_value(state)?,
            actor,
            None,
            metadata,
        )
        .await?;
    Ok(event.sequence_number)
}

async fn append_transition_event(
    events: &EventStore,
    state_machine_id: &str,
    transition: &StateTransition,
) -> PersistResult<()> {
    events
        .append(
            state_machine_id,
            EventType::Transitioned,
            serde_json::to_value(transition)?,
            transition.actor_id.as_deref(),
            None,
        )
        .await?;
    Ok(())
}

async fn append_deleted_event(events: &EventStore, state_machine_id: &str) -> PersistResult<bool> {
    if events.stream_version(state_machine_id).await? == 0 {
        return Ok(false);
    }
    events
        .append(state_machine_id, EventType::Deleted, Value::Object(Default::default()), None, None)
        .await?;
    Ok(true)
}

async fn event_versions(events: &EventStore, state_machine_id: &str) -> PersistResult<Vec<StateVersion>> {
    events
        .get_events(state_machine_id, 0, None)
        .await?
        .iter()
        .map(|e| {
            StateVersion::from_sequence(e.sequence_number).ok_or_else(|| {
                PersistError::ValidationFailure(format!(
                    "sequence {} of {} has no version",
                    e.sequence_number, state_machine_id
                ))
            })
        })
        .collect()
}

/// Event-backed load of the latest state or of `0.0.<seq>`
async fn load_from_events(
    events: &EventStore,
    snapshots: Option<&SnapshotManager>,
    state_machine_id: &str,
    version: Option<&StateVersion>,
) -> PersistResult<Option<PersistedState>> {
    let target = match version {
        None => None,
        Some(version) => match version.as_sequence() {
            Some(sequence) => Some(sequence),
            None => return Ok(None),
        },
    };
    events.rebuild_with_snapshots(state_machine_id, snapshots, target).await
}

/// State as a fold over the event stream
///
/// Snapshots, when attached, only seed replays of a compacted stream.
pub struct EventSourcedStrategy {
    events: Arc<EventStore>,
    snapshots: Option<Arc<SnapshotManager>>,
}

impl EventSourcedStrategy {
    pub fn new(events: Arc<EventStore>) -> Self {
        Self { events, snapshots: None }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotManager>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }
}

#[async_trait]
impl PersistenceStrategy for EventSourcedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::EventSourced
    }

    async fn save(&self, state_machine_id: &str, state: &PersistedState) -> PersistResult<String> {
        let sequence = append_state_event(&self.events, state_machine_id, state).await?;
        Ok(format!("{}:{}", state_machine_id, sequence))
    }

    async fn load(&self, state_machine_id: &str, version: Option<&StateVersion>) -> PersistResult<Option<PersistedState>> {
        load_from_events(&self.events, self.snapshots.as_deref(), state_machine_id, version).await
    }

    async fn delete(&self, state_machine_id: &str) -> PersistResult<bool> {
        append_deleted_event(&self.events, state_machine_id).await
    }

    async fn list_versions(&self, state_machine_id: &str) -> PersistResult<Vec<StateVersion>> {
        event_versions(&self.events, state_machine_id).await
    }

    async fn record_transition(&self, state_machine_id: &str, transition: &StateTransition) -> PersistResult<()> {
        append_transition_event(&self.events, state_machine_id, transition).await
    }
}

/// Events for every save plus periodic snapshots to bound replay
pub struct HybridStrategy {
    events: Arc<EventStore>,
    snapshots: Arc<SnapshotManager>,
}

impl HybridStrategy {
    pub fn new(events: Arc<EventStore>, snapshots: Arc<SnapshotManager>) -> Self {
        Self { events, snapshots }
    }

    /// Snapshot `state` as covering `sequence`; failures leave events authoritative
    async fn snapshot_at(&self, state_machine_id: &str, state: &PersistedState, sequence: u64, tags: Vec<String>) {
        let mut covered = state.clone();
        covered.set_sequence_number(sequence);
        let result = match self.snapshots.create_snapshot(state_machine_id, &covered, tags).await {
            Ok(_) => self.events.mark_snapshot(state_machine_id, sequence).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(
                state_machine_id = %state_machine_id,
                sequence,
                error = %e,
                "Hybrid snapshot failed, events remain authoritative"
            );
        }
    }
}

#[async_trait]
impl PersistenceStrategy for HybridStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    async fn save(&self, state_machine_id: &str, state: &PersistedState) -> PersistResult<String> {
        let sequence = append_state_event(&self.events, state_machine_id, state).await?;

        if self.snapshots.should_snapshot(state_machine_id, false) {
            self.snapshot_at(state_machine_id, state, sequence, Vec::new()).await;
        }
        Ok(format!("{}:{}", state_machine_id, sequence))
    }

    async fn load(&self, state_machine_id: &str, version: Option<&StateVersion>) -> PersistResult<Option<PersistedState>> {
        if version.is_some() {
            return load_from_events(&self.events, Some(&self.snapshots), state_machine_id, version).await;
        }

        let snapshot = match self.snapshots.restore_snapshot(state_machine_id, None).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(
                    state_machine_id = %state_machine_id,
                    error = %e,
                    "Snapshot unusable, rebuilding from events"
                );
                None
            }
        };

        let floor = self.events.compacted_through(state_machine_id).await?;
        if let Some(base) = snapshot {
            let after = base.sequence_number().unwrap_or(0);
            if after >= floor {
                let state = self.events.replay_onto(state_machine_id, base, after).await?;
                return Ok((!state.is_deleted()).then_some(state));
            }
        }
        load_from_events(&self.events, Some(&self.snapshots), state_machine_id, None).await
    }

    async fn delete(&self, state_machine_id: &str) -> PersistResult<bool> {
        let existed = append_deleted_event(&self.events, state_machine_id).await?;
        for metadata in self.snapshots.list_metadata(state_machine_id).await? {
            self.snapshots
                .delete_snapshot(state_machine_id, &metadata.snapshot_id)
                .await?;
        }
        self.snapshots.forget(state_machine_id);
        Ok(existed)
    }

    async fn list_versions(&self, state_machine_id: &str) -> PersistResult<Vec<StateVersion>> {
        event_versions(&self.events, state_machine_id).await
    }

    /// Appends the transition; a phase change may also trigger a snapshot
    async fn record_transition(&self, state_machine_id: &str, transition: &StateTransition) -> PersistResult<()> {
        append_transition_event(&self.events, state_machine_id, transition).await?;

        if transition.is_phase_change() && self.snapshots.should_snapshot(state_machine_id, true) {
            if let Some(state) = self.load(state_machine_id, None).await? {
                let sequence = state.sequence_number().unwrap_or(0);
                self.snapshot_at(state_machine_id, &state, sequence, vec!["major".to_string()])
                    .await;
            }
        }
        Ok(())
    }
}

/// Every save is a new entry in the version manager
pub struct VersionedStrategy {
    versions: Arc<StateVersionManager>,
}

impl VersionedStrategy {
    pub fn new(versions: Arc<StateVersionManager>) -> Self {
        Self { versions }
    }
}

#[async_trait]
impl PersistenceStrategy for VersionedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Versioned
    }

    async fn save(&self, state_machine_id: &str, state: &PersistedState) -> PersistResult<String> {
        let version = self.versions.save(state_machine_id, state.clone(), None).await?;
        Ok(format!("{}@{}", state_machine_id, version))
    }

    async fn save_version(
        &self,
        state_machine_id: &str,
        state: &PersistedState,
        version: StateVersion,
    ) -> PersistResult<String> {
        let version = self
            .versions
            .save(state_machine_id, state.clone(), Some(version))
            .await?;
        Ok(format!("{}@{}", state_machine_id, version))
    }

    /// One backend write for the whole batch when the backend supports it
    async fn save_batch(&self, batch: &[(String, PersistedState)]) -> Vec<PersistResult<String>> {
        match self.versions.save_many(batch.to_vec()).await {
            Ok(Some(versions)) => {
                return batch
                    .iter()
                    .zip(versions)
                    .map(|((state_machine_id, _), version)| Ok(format!("{}@{}", state_machine_id, version)))
                    .collect();
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(entries = batch.len(), error = %e, "Batch save failed, saving one by one");
            }
        }

        let mut results = Vec::with_capacity(batch.len());
        for (state_machine_id, state) in batch {
            results.push(self.save(state_machine_id, state).await);
        }
        results
    }

    async fn load(&self, state_machine_id: &str, version: Option<&StateVersion>) -> PersistResult<Option<PersistedState>> {
        self.versions.load(state_machine_id, version).await
    }

    async fn delete(&self, state_machine_id: &str) -> PersistResult<bool> {
        self.versions.delete(state_machine_id).await
    }

    async fn list_versions(&self, state_machine_id: &str) -> PersistResult<Vec<StateVersion>> {
        self.versions.list_versions(state_machine_id).await
    }
}

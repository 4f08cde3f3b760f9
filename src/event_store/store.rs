//! Event Store - append-only per-state-machine event logs
//!
//! The EventStore assigns sequence numbers, persists events to an optional
//! storage backend, and rebuilds state by folding events through the
//! registered projections.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use super::handler::EventHandler;
use super::projection::{DefaultProjection, Projection};
use crate::config::EventStoreConfig;
use crate::error::{PersistError, PersistResult};
use crate::snapshot::SnapshotManager;
use crate::storage::{DocumentQuery, StorageBackend};
use crate::types::{EventStream, EventType, PersistedState, StateData, StateEvent};
use crate::utils::{system_clock, Clock};

const EVENT_PREFIX: &str = "events/";
const HEAD_PREFIX: &str = "event_heads/";

/// `None` until the stream has been loaded from the backend
type StreamSlot = Arc<AsyncMutex<Option<EventStream>>>;

fn stream_prefix(state_machine_id: &str) -> String {
    format!("{}{}/", EVENT_PREFIX, state_machine_id)
}

fn event_key(state_machine_id: &str, sequence: u64) -> String {
    format!("{}{:020}", stream_prefix(state_machine_id), sequence)
}

fn head_key(state_machine_id: &str) -> String {
    format!("{}{}", HEAD_PREFIX, state_machine_id)
}

/// Split `events/<id>/<seq>` into its id and sequence number
fn parse_event_key(key: &str) -> Option<(&str, u64)> {
    let rest = key.strip_prefix(EVENT_PREFIX)?;
    let (id, seq) = rest.rsplit_once('/')?;
    Some((id, seq.parse().ok()?))
}

/// Stream bookkeeping that cannot be derived from the stored events
///
/// Written whenever compaction, a snapshot mark or a delete changes it.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StreamHead {
    version: u64,
    #[serde(default)]
    last_snapshot_version: u64,
    #[serde(default)]
    compacted_through: u64,
    #[serde(default)]
    reset_at: u64,
}

impl StreamHead {
    fn of(stream: &EventStream) -> Self {
        Self {
            version: stream.version,
            last_snapshot_version: stream.last_snapshot_version,
            compacted_through: stream.compacted_through,
            reset_at: stream.reset_at,
        }
    }
}

/// The EventStore manages append-only event streams and state replay
pub struct EventStore {
    config: EventStoreConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    clock: Arc<dyn Clock>,
    streams: Mutex<HashMap<String, StreamSlot>>,
    projections: RwLock<Vec<Arc<dyn Projection>>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventStore {
    /// In-memory store with the default projection registered
    pub fn new() -> Self {
        Self::with_config(EventStoreConfig::default())
    }

    pub fn with_config(config: EventStoreConfig) -> Self {
        Self {
            config,
            backend: None,
            clock: system_clock(),
            streams: Mutex::new(HashMap::new()),
            projections: RwLock::new(vec![Arc::new(DefaultProjection)]),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Persist every event to `backend` before it becomes visible
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    /// Projections run after every previously registered one
    pub fn register_projection(&self, projection: Arc<dyn Projection>) {
        self.projections.write().push(projection);
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    fn slot(&self, state_machine_id: &str) -> StreamSlot {
        self.streams
            .lock()
            .entry(state_machine_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Stored event documents of one stream
    ///
    /// Queryable backends return them sorted in a single call.
    async fn stored_events(&self, backend: &dyn StorageBackend, state_machine_id: &str) -> PersistResult<Vec<Value>> {
        let belongs = |key: &str| matches!(parse_event_key(key), Some((id, _)) if id == state_machine_id);

        if let Some(queryable) = backend.as_queryable() {
            let query = DocumentQuery::prefix(stream_prefix(state_machine_id)).sort_by("sequence_number", false);
            return Ok(queryable
                .query(&query)
                .await?
                .into_iter()
                .filter(|(key, _)| belongs(key))
                .map(|(_, value)| value)
                .collect());
        }

        let mut stored = Vec::new();
        for key in backend.list_prefix(&stream_prefix(state_machine_id)).await? {
            if !belongs(&key) {
                continue;
            }
            if let Some(value) = backend.get(&key).await? {
                stored.push(value);
            }
        }
        Ok(stored)
    }

    /// Load a stream from the backend (empty without one)
    async fn load_stream(&self, state_machine_id: &str) -> PersistResult<EventStream> {
        let Some(backend) = &self.backend else {
            return Ok(EventStream::new(state_machine_id));
        };

        let head: StreamHead = match backend.get(&head_key(state_machine_id)).await? {
            Some(value) => serde_json::from_value(value)?,
            None => StreamHead::default(),
        };

        // Events at or below the floor are leftovers of an interrupted compaction or delete
        let floor = head.compacted_through.max(head.reset_at);
        let mut events = Vec::new();
        for value in self.stored_events(backend.as_ref(), state_machine_id).await? {
            let event: StateEvent = serde_json::from_value(value)?;
            if event.sequence_number > floor {
                events.push(event);
            }
        }

        let mut stream = if self.config.verify_on_load {
            EventStream::from_events(state_machine_id, events)?
        } else {
            events.sort_by_key(|e| e.sequence_number);
            let mut stream = EventStream::new(state_machine_id);
            stream.version = events.last().map(|e| e.sequence_number).unwrap_or(0);
            stream.events = events;
            stream
        };

        stream.compacted_through = head.compacted_through;
        stream.reset_at = head.reset_at;
        stream.version = stream.version.max(head.version);
        stream.last_snapshot_version = head.last_snapshot_version.min(stream.version);

        if self.config.verify_on_load {
            if let Some(first) = stream.first_sequence() {
                let expected = stream.expected_first();
                if first != expected {
                    return Err(PersistError::SequenceGapDetected {
                        state_machine_id: state_machine_id.to_string(),
                        expected,
                        found: first,
                    });
                }
            }
        }
        Ok(stream)
    }

    async fn write_head(&self, stream: &EventStream) -> PersistResult<()> {
        if let Some(backend) = &self.backend {
            backend
                .set(&head_key(&stream.state_machine_id), serde_json::to_value(StreamHead::of(stream))?)
                .await?;
        }
        Ok(())
    }

    async fn ensure_loaded<'a>(
        &self,
        state_machine_id: &str,
        slot: &'a mut Option<EventStream>,
    ) -> PersistResult<&'a mut EventStream> {
        let stream = match slot.take() {
            Some(stream) => stream,
            None => {
                let stream = self.load_stream(state_machine_id).await?;
                tracing::debug!(
                    state_machine_id = %state_machine_id,
                    events = stream.len(),
                    version = stream.version,
                    compacted_through = stream.compacted_through,
                    "Loaded event stream"
                );
                stream
            }
        };
        Ok(slot.insert(stream))
    }

    /// Run `f` against the loaded stream of `state_machine_id`
    async fn read_stream<T>(
        &self,
        state_machine_id: &str,
        f: impl FnOnce(&EventStream) -> T,
    ) -> PersistResult<T> {
        let slot = self.slot(state_machine_id);
        let mut guard = slot.lock().await;
        let stream = self.ensure_loaded(state_machine_id, &mut guard).await?;
        Ok(f(stream))
    }

    /// Append an event and assign it the next sequence number
    ///
    /// The event is written to the backend (if any) while the stream lock is
    /// held, so readers never observe an event that is not yet durable.
    /// Handlers run after the lock is released.
    pub async fn append(
        &self,
        state_machine_id: &str,
        event_type: EventType,
        event_data: Value,
        actor_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> PersistResult<StateEvent> {
        self.append_with_metadata(state_machine_id, event_type, event_data, actor_id, correlation_id, StateData::new())
            .await
    }

    /// [`EventStore::append`] with event metadata read by projections
    pub async fn append_with_metadata(
        &self,
        state_machine_id: &str,
        event_type: EventType,
        event_data: Value,
        actor_id: Option<&str>,
        correlation_id: Option<&str>,
        metadata: StateData,
    ) -> PersistResult<StateEvent> {
        if state_machine_id.is_empty() {
            return Err(PersistError::ValidationFailure(
                "state machine id must not be empty".to_string(),
            ));
        }
        if self.config.require_object_data && !(event_data.is_object() || event_data.is_null()) {
            return Err(PersistError::ValidationFailure(format!(
                "{} event data must be a JSON object",
                event_type
            )));
        }

        let slot = self.slot(state_machine_id);
        let event = {
            let mut guard = slot.lock().await;
            let stream = self.ensure_loaded(state_machine_id, &mut guard).await?;

            let mut event = StateEvent::new(
                state_machine_id,
                event_type,
                event_data,
                stream.next_sequence(),
                self.clock.now(),
            )
            .with_actor(actor_id.map(str::to_string))
            .with_correlation(correlation_id.map(str::to_string));
            event.metadata = metadata;

            if let Some(backend) = &self.backend {
                backend
                    .set(
                        &event_key(state_machine_id, event.sequence_number),
                        serde_json::to_value(&event)?,
                    )
                    .await?;
            }
            stream.push(event.clone())?;
            event
        };

        tracing::debug!(
            state_machine_id = %state_machine_id,
            sequence = event.sequence_number,
            event_type = %event.event_type,
            "Appended event"
        );

        self.dispatch(&event).await;
        Ok(event)
    }

    async fn dispatch(&self, event: &StateEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.handles(event.event_type))
            .cloned()
            .collect();

        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::warn!(
                    handler = handler.name(),
                    state_machine_id = %event.state_machine_id,
                    sequence = event.sequence_number,
                    error = %e,
                    "Event handler failed"
                );
            }
        }
    }

    /// Events with `from_sequence < sequence <= to_sequence`
    pub async fn get_events(
        &self,
        state_machine_id: &str,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> PersistResult<Vec<StateEvent>> {
        self.read_stream(state_machine_id, |stream| {
            stream.range(from_sequence, to_sequence).cloned().collect()
        })
        .await
    }

    /// A copy of the whole stream
    pub async fn get_stream(&self, state_machine_id: &str) -> PersistResult<EventStream> {
        self.read_stream(state_machine_id, |stream| stream.clone()).await
    }

    /// Latest sequence number, 0 for an empty stream
    pub async fn stream_version(&self, state_machine_id: &str) -> PersistResult<u64> {
        self.read_stream(state_machine_id, |stream| stream.version).await
    }

    /// Highest sequence removed by compaction, 0 when nothing was compacted
    pub async fn compacted_through(&self, state_machine_id: &str) -> PersistResult<u64> {
        self.read_stream(state_machine_id, |stream| stream.compacted_through).await
    }

    /// Apply every matching projection to one event, in registration order
    pub fn apply_event(&self, state: PersistedState, event: &StateEvent) -> PersistResult<PersistedState> {
        let projections: Vec<Arc<dyn Projection>> = self.projections.read().clone();
        let mut state = state;
        for projection in projections.iter().filter(|p| p.can_handle(event.event_type)) {
            state = projection.apply(state, event)?;
        }
        Ok(state)
    }

    fn fold<'a>(
        &self,
        base: PersistedState,
        events: impl IntoIterator<Item = &'a StateEvent>,
    ) -> PersistResult<PersistedState> {
        events
            .into_iter()
            .try_fold(base, |state, event| self.apply_event(state, event))
    }

    fn compacted(state_machine_id: &str, compacted_through: u64) -> PersistError {
        PersistError::StreamCompacted {
            state_machine_id: state_machine_id.to_string(),
            compacted_through,
        }
    }

    /// Rebuild the current state from events after `from_version`
    ///
    /// Returns `None` when there is nothing to replay or the state machine
    /// has been deleted. Fails with `StreamCompacted` when events the fold
    /// needs were compacted away.
    pub async fn get_current_state(
        &self,
        state_machine_id: &str,
        from_version: u64,
    ) -> PersistResult<Option<PersistedState>> {
        let (events, floor) = self
            .read_stream(state_machine_id, |stream| {
                (stream.range(from_version, None).cloned().collect::<Vec<_>>(), stream.compacted_through)
            })
            .await?;
        if floor > from_version {
            return Err(Self::compacted(state_machine_id, floor));
        }
        if events.is_empty() {
            return Ok(None);
        }

        let state = self.fold(PersistedState::new(state_machine_id), &events)?;
        Ok((!state.is_deleted()).then_some(state))
    }

    /// The state as it was right after event `version` was applied
    pub async fn get_state_at_version(
        &self,
        state_machine_id: &str,
        version: u64,
    ) -> PersistResult<Option<PersistedState>> {
        self.rebuild(state_machine_id, None, Some(version)).await
    }

    /// Fold events `(base sequence, to]` onto `base`, or onto an empty state
    ///
    /// `to` defaults to the stream version. Returns `None` for an unknown
    /// target, a deleted state, or no base and no events to fold.
    pub async fn rebuild(
        &self,
        state_machine_id: &str,
        base: Option<PersistedState>,
        to: Option<u64>,
    ) -> PersistResult<Option<PersistedState>> {
        let stream = self.get_stream(state_machine_id).await?;
        let target = to.unwrap_or(stream.version);
        if target == 0 || target > stream.version {
            return Ok(None);
        }

        let (seed, after) = match base {
            Some(base) => {
                let after = base.sequence_number().unwrap_or(0);
                (Some(base), after)
            }
            None => (None, 0),
        };
        if after > target {
            return Ok(None);
        }
        if after < stream.compacted_through && target > after {
            return Err(Self::compacted(state_machine_id, stream.compacted_through));
        }

        let events: Vec<&StateEvent> = stream.range(after, Some(target)).collect();
        let Some(seed) = seed.or_else(|| (!events.is_empty()).then(|| PersistedState::new(state_machine_id))) else {
            return Ok(None);
        };
        let state = self.fold(seed, events)?;
        Ok((!state.is_deleted()).then_some(state))
    }

    /// Rebuild up to `to`, seeding from a covering snapshot once compacted
    ///
    /// An uncompacted stream is folded from its first event. A compacted one
    /// needs a snapshot whose sequence lies between the compaction floor and
    /// the target; without one this fails with `StreamCompacted`.
    pub async fn rebuild_with_snapshots(
        &self,
        state_machine_id: &str,
        snapshots: Option<&SnapshotManager>,
        to: Option<u64>,
    ) -> PersistResult<Option<PersistedState>> {
        let (version, floor) = self
            .read_stream(state_machine_id, |stream| (stream.version, stream.compacted_through))
            .await?;
        if floor == 0 {
            return self.rebuild(state_machine_id, None, to).await;
        }

        let target = to.unwrap_or(version);
        let covering = match snapshots {
            Some(snapshots) => snapshots.load_covering(state_machine_id, floor, target).await?,
            None => None,
        };
        match covering {
            Some((metadata, base)) => {
                tracing::debug!(
                    state_machine_id = %state_machine_id,
                    snapshot_id = %metadata.snapshot_id,
                    compacted_through = floor,
                    "Seeding replay from covering snapshot"
                );
                self.rebuild(state_machine_id, Some(base), Some(target)).await
            }
            None => Err(Self::compacted(state_machine_id, floor)),
        }
    }

    /// Fold events after `after_sequence` onto an already materialized state
    pub async fn replay_onto(
        &self,
        state_machine_id: &str,
        base: PersistedState,
        after_sequence: u64,
    ) -> PersistResult<PersistedState> {
        let (events, floor) = self
            .read_stream(state_machine_id, |stream| {
                (stream.range(after_sequence, None).cloned().collect::<Vec<_>>(), stream.compacted_through)
            })
            .await?;
        if after_sequence < floor {
            return Err(Self::compacted(state_machine_id, floor));
        }
        self.fold(base, &events)
    }

    /// Re-read the stream from the backend and verify it has no gaps
    ///
    /// Returns the verified stream version.
    pub async fn verify_stream(&self, state_machine_id: &str) -> PersistResult<u64> {
        let result = match &self.backend {
            Some(_) => self.load_stream(state_machine_id).await,
            None => self.get_stream(state_machine_id).await,
        };
        let checked = result.and_then(|stream| {
            let expected = stream.expected_first();
            let rebuilt = EventStream::from_events(state_machine_id, stream.events)?;
            match rebuilt.first_sequence() {
                Some(first) if first != expected => Err(PersistError::SequenceGapDetected {
                    state_machine_id: state_machine_id.to_string(),
                    expected,
                    found: first,
                }),
                _ => Ok(rebuilt.version.max(stream.version)),
            }
        });
        checked.map_err(|e| {
            tracing::error!(state_machine_id = %state_machine_id, error = %e, "Event stream corrupted");
            e
        })
    }

    /// Record that a snapshot covers the stream up to `sequence`
    pub async fn mark_snapshot(&self, state_machine_id: &str, sequence: u64) -> PersistResult<()> {
        let slot = self.slot(state_machine_id);
        let mut guard = slot.lock().await;
        let stream = self.ensure_loaded(state_machine_id, &mut guard).await?;
        let marked = sequence.min(stream.version).max(stream.last_snapshot_version);
        if marked != stream.last_snapshot_version {
            stream.last_snapshot_version = marked;
            self.write_head(stream).await?;
        }
        Ok(())
    }

    /// Drop the leading run of events older than `before`
    ///
    /// Only events already covered by a snapshot are eligible. Reads that
    /// reach into the removed range must then be seeded from that snapshot.
    /// Returns the number of events removed.
    pub async fn compact(&self, state_machine_id: &str, before: DateTime<Utc>) -> PersistResult<usize> {
        let slot = self.slot(state_machine_id);
        let mut guard = slot.lock().await;
        let stream = self.ensure_loaded(state_machine_id, &mut guard).await?;

        let cutoff = stream.last_snapshot_version;
        let removable = stream
            .events
            .iter()
            .take_while(|e| e.timestamp < before && e.sequence_number <= cutoff)
            .count();
        if removable == 0 {
            return Ok(0);
        }

        let compacted_through = stream.events[removable - 1].sequence_number;
        let mut compacted = stream.clone();
        compacted.events.drain(..removable);
        compacted.compacted_through = compacted_through;

        // Head first; load ignores events left at or below the floor
        self.write_head(&compacted).await?;
        if let Some(backend) = &self.backend {
            for event in &stream.events[..removable] {
                backend
                    .delete(&event_key(state_machine_id, event.sequence_number))
                    .await?;
            }
        }
        *stream = compacted;

        tracing::info!(
            state_machine_id = %state_machine_id,
            removed = removable,
            compacted_through,
            "Compacted event stream"
        );
        Ok(removable)
    }

    /// Remove a stream and its persisted events
    ///
    /// The version is kept as a high-water mark, so a reused id continues
    /// numbering after it.
    pub async fn delete_stream(&self, state_machine_id: &str) -> PersistResult<bool> {
        let slot = self.slot(state_machine_id);
        let mut guard = slot.lock().await;
        let stream = self.ensure_loaded(state_machine_id, &mut guard).await?;
        let existed = !stream.is_empty() || stream.version > stream.reset_at;
        if !existed {
            return Ok(false);
        }

        let mut reset = EventStream::new(state_machine_id);
        reset.version = stream.version;
        reset.reset_at = stream.version;

        self.write_head(&reset).await?;
        if let Some(backend) = &self.backend {
            for event in &stream.events {
                backend
                    .delete(&event_key(state_machine_id, event.sequence_number))
                    .await?;
            }
        }
        *stream = reset;
        Ok(existed)
    }

    /// Ids of every non-empty stream, in memory or in the backend
    pub async fn list_stream_ids(&self) -> PersistResult<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();

        let slots: Vec<(String, StreamSlot)> = self
            .streams
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        for (id, slot) in slots {
            if let Some(stream) = slot.lock().await.as_ref() {
                if !stream.is_empty() {
                    ids.push(id);
                }
            }
        }

        if let Some(backend) = &self.backend {
            for key in backend.list_prefix(EVENT_PREFIX).await? {
                if let Some((id, _)) = parse_event_key(&key) {
                    ids.push(id.to_string());
                }
            }
        }

        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::FnEventHandler;
    use crate::storage::InMemoryBackend;
    use crate::types::StateTransition;
    use crate::utils::FakeClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn seeded_store() -> EventStore {
        let store = EventStore::new();
        store
            .append("g1", EventType::Created, json!({"current_state": "lobby"}), Some("host"), None)
            .await
            .unwrap();
        let start = StateTransition::new("lobby", "playing", "start").with_field("round", json!(1));
        store
            .append("g1", EventType::Transitioned, serde_json::to_value(&start).unwrap(), None, None)
            .await
            .unwrap();
        store
            .append("g1", EventType::Updated, json!({"round": 2}), None, Some("req-1"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_sequences() {
        let store = seeded_store().await;
        let events = store.get_events("g1", 0, None).await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(events[0].actor_id.as_deref(), Some("host"));
        assert_eq!(events[2].correlation_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_get_events_range_is_exclusive_inclusive() {
        let store = seeded_store().await;
        let events = store.get_events("g1", 1, Some(2)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn test_current_state_and_state_at_version() {
        let store = seeded_store().await;

        let current = store.get_current_state("g1", 0).await.unwrap().unwrap();
        assert_eq!(current.current_state, "playing");
        assert_eq!(current.get("round"), Some(&json!(2)));

        let at_two = store.get_state_at_version("g1", 2).await.unwrap().unwrap();
        assert_eq!(at_two.get("round"), Some(&json!(1)));

        assert!(store.get_state_at_version("g1", 9).await.unwrap().is_none());
        assert!(store.get_current_state("unknown", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_non_object_data() {
        let store = EventStore::new();
        let result = store.append("g1", EventType::Updated, json!(42), None, None).await;
        assert!(matches!(result, Err(PersistError::ValidationFailure(_))));
        assert_eq!(store.stream_version("g1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deleted_state_is_hidden() {
        let store = seeded_store().await;
        store.append("g1", EventType::Deleted, json!({}), None, None).await.unwrap();
        assert!(store.get_current_state("g1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_roll_back() {
        let store = EventStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        store.register_handler(Arc::new(FnEventHandler::new("counter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));
        store.register_handler(Arc::new(FnEventHandler::new("broken", |_| {
            Err(PersistError::storage("downstream unavailable"))
        })));

        store.append("g1", EventType::Created, json!({}), None, None).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.stream_version("g1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backend_reload_and_gap_detection() {
        let backend = Arc::new(InMemoryBackend::new());
        {
            let store = EventStore::new().with_backend(backend.clone());
            for round in 1..=3 {
                store
                    .append("g1", EventType::Updated, json!({"round": round}), None, None)
                    .await
                    .unwrap();
            }
        }

        let reopened = EventStore::new().with_backend(backend.clone());
        assert_eq!(reopened.verify_stream("g1").await.unwrap(), 3);
        let state = reopened.get_current_state("g1", 0).await.unwrap().unwrap();
        assert_eq!(state.get("round"), Some(&json!(3)));

        backend.delete(&event_key("g1", 2)).await.unwrap();
        let broken = EventStore::new().with_backend(backend);
        let err = broken.get_events("g1", 0, None).await.unwrap_err();
        assert!(matches!(
            err,
            PersistError::SequenceGapDetected { expected: 2, found: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_compact_only_removes_snapshotted_prefix() {
        let clock = FakeClock::new();
        let store = EventStore::new().with_clock(Arc::new(clock.clone()));
        for round in 1..=4 {
            store
                .append("g1", EventType::Updated, json!({"round": round}), None, None)
                .await
                .unwrap();
            clock.advance(chrono::Duration::minutes(1));
        }

        // Nothing is covered by a snapshot yet
        assert_eq!(store.compact("g1", clock.now()).await.unwrap(), 0);

        store.mark_snapshot("g1", 2).await.unwrap();
        assert_eq!(store.compact("g1", clock.now()).await.unwrap(), 2);

        let stream = store.get_stream("g1").await.unwrap();
        assert_eq!(stream.first_sequence(), Some(3));
        assert_eq!(stream.version, 4);
        assert_eq!(store.verify_stream("g1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_delete_and_list_streams() {
        let store = seeded_store().await;
        store.append("g2", EventType::Created, json!({}), None, None).await.unwrap();
        assert_eq!(store.list_stream_ids().await.unwrap(), vec!["g1", "g2"]);

        assert!(store.delete_stream("g1").await.unwrap());
        assert!(!store.delete_stream("g1").await.unwrap());
        assert_eq!(store.list_stream_ids().await.unwrap(), vec!["g2"]);
    }

    #[tokio::test]
    async fn test_compaction_survives_reload() {
        let clock = FakeClock::new();
        let backend = Arc::new(InMemoryBackend::new());
        {
            let store = EventStore::new()
                .with_backend(backend.clone())
                .with_clock(Arc::new(clock.clone()));
            for round in 1..=4 {
                store
                    .append("g1", EventType::Updated, json!({"round": round}), None, None)
                    .await
                    .unwrap();
                clock.advance(chrono::Duration::minutes(1));
            }
            store.mark_snapshot("g1", 3).await.unwrap();
            assert_eq!(store.compact("g1", clock.now()).await.unwrap(), 3);
        }

        let reopened = EventStore::new().with_backend(backend);
        let stream = reopened.get_stream("g1").await.unwrap();
        assert_eq!(stream.compacted_through, 3);
        assert_eq!(stream.last_snapshot_version, 3);
        assert_eq!(stream.version, 4);
        assert_eq!(reopened.verify_stream("g1").await.unwrap(), 4);

        // A fold from the start cannot see the removed events
        let err = reopened.get_current_state("g1", 0).await.unwrap_err();
        assert!(matches!(err, PersistError::StreamCompacted { compacted_through: 3, .. }));
        assert!(reopened.get_state_at_version("g1", 4).await.is_err());
        assert!(reopened.rebuild_with_snapshots("g1", None, None).await.is_err());

        let mut base = PersistedState::new("g1");
        base.state_data.insert("round".to_string(), json!(3));
        base.set_sequence_number(3);
        let state = reopened.rebuild("g1", Some(base), None).await.unwrap().unwrap();
        assert_eq!(state.get("round"), Some(&json!(4)));
        assert_eq!(state.sequence_number(), Some(4));

        let next = reopened
            .append("g1", EventType::Updated, json!({"round": 5}), None, None)
            .await
            .unwrap();
        assert_eq!(next.sequence_number, 5);
    }

    #[tokio::test]
    async fn test_delete_keeps_sequence_high_water() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = EventStore::new().with_backend(backend.clone());
        for round in 1..=3 {
            store
                .append("g1", EventType::Updated, json!({"round": round}), None, None)
                .await
                .unwrap();
        }
        assert!(store.delete_stream("g1").await.unwrap());
        assert!(store.get_current_state("g1", 0).await.unwrap().is_none());

        let reused = store
            .append("g1", EventType::Created, json!({"current_state": "lobby"}), None, None)
            .await
            .unwrap();
        assert_eq!(reused.sequence_number, 4);

        let reopened = EventStore::new().with_backend(backend);
        assert_eq!(reopened.verify_stream("g1").await.unwrap(), 4);
        let state = reopened.get_current_state("g1", 0).await.unwrap().unwrap();
        assert_eq!(state.current_state, "lobby");
        assert!(state.get("round").is_none());
        assert_eq!(
            reopened
                .append("g1", EventType::Updated, json!({"round": 1}), None, None)
                .await
                .unwrap()
                .sequence_number,
            5
        );
    }

    /// Serves documents only through queries; listing fails
    struct QueryOnlyBackend(InMemoryBackend);

    #[async_trait::async_trait]
    impl StorageBackend for QueryOnlyBackend {
        fn name(&self) -> &str {
            "query_only"
        }

        async fn get(&self, key: &str) -> PersistResult<Option<Value>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> PersistResult<()> {
            self.0.set(key, value).await
        }

        async fn delete(&self, key: &str) -> PersistResult<bool> {
            self.0.delete(key).await
        }

        async fn list_prefix(&self, _prefix: &str) -> PersistResult<Vec<String>> {
            Err(PersistError::storage("listing disabled"))
        }

        fn as_queryable(&self) -> Option<&dyn crate::storage::QueryableBackend> {
            self.0.as_queryable()
        }
    }

    #[tokio::test]
    async fn test_stream_loads_through_query() {
        let backend = Arc::new(QueryOnlyBackend(InMemoryBackend::new()));
        {
            let store = EventStore::new().with_backend(backend.clone());
            for round in 1..=12 {
                store
                    .append("g1", EventType::Updated, json!({"round": round}), None, None)
                    .await
                    .unwrap();
            }
            store.append("g10", EventType::Created, json!({}), None, None).await.unwrap();
        }

        let reopened = EventStore::new().with_backend(backend);
        let events = reopened.get_events("g1", 0, None).await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequences, (1..=12).collect::<Vec<u64>>());
        let state = reopened.get_current_state("g1", 0).await.unwrap().unwrap();
        assert_eq!(state.get("round"), Some(&json!(12)));
    }

    #[test]
    fn test_parse_event_key() {
        assert_eq!(parse_event_key(&event_key("room/7", 12)), Some(("room/7", 12)));
        assert_eq!(parse_event_key("states/x"), None);
    }
}

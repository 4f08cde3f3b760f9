//! Recovery strategies
//!
//! - `SnapshotRecovery`: restore a stored snapshot
//! - `EventSourcedRecovery`: replay the event stream
//! - `HybridRecovery`: snapshot plus the transitions logged after it,
//!   falling back to event replay

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::{RecoveryMode, RecoveryOptions, RecoveryResult};
use crate::error::PersistResult;
use crate::event_store::EventStore;
use crate::snapshot::SnapshotManager;
use crate::transition_log::TransitionLogger;
use crate::types::{EventType, PersistedState, RecoveryPoint, SnapshotMetadata, StateEvent, StateTransition};
use crate::utils::{system_clock, to_chrono, Clock};

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn can_recover(&self, mode: &RecoveryMode) -> bool;

    /// Recover a state machine
    ///
    /// Nothing to recover from is a `Failed` result; only hard errors such
    /// as corruption are returned as `Err`.
    async fn recover(&self, state_machine_id: &str, options: &RecoveryOptions) -> PersistResult<RecoveryResult>;
}

fn snapshot_point(metadata: &SnapshotMetadata, state: &PersistedState) -> RecoveryPoint {
    let mut point = metadata.to_recovery_point();
    point.state_snapshot = Some(state.clone());
    point
}

/// Restores stored snapshots
pub struct SnapshotRecovery {
    snapshots: Arc<SnapshotManager>,
}

impl SnapshotRecovery {
    pub fn new(snapshots: Arc<SnapshotManager>) -> Self {
        Self { snapshots }
    }

    /// The snapshot a mode points at, if any
    async fn locate(
        &self,
        state_machine_id: &str,
        mode: &RecoveryMode,
    ) -> PersistResult<Option<(SnapshotMetadata, PersistedState)>> {
        match mode {
            RecoveryMode::Latest => self.snapshots.load_snapshot(state_machine_id, None).await,
            RecoveryMode::Snapshot(id) => self.snapshots.load_snapshot(state_machine_id, Some(id)).await,
            RecoveryMode::PointInTime(at) => {
                match self.snapshots.metadata_at_or_before(state_machine_id, *at).await? {
                    Some(metadata) => {
                        self.snapshots
                            .load_snapshot(state_machine_id, Some(&metadata.snapshot_id))
                            .await
                    }
                    None => Ok(None),
                }
            }
            RecoveryMode::BeforeError => Ok(None),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for SnapshotRecovery {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn can_recover(&self, mode: &RecoveryMode) -> bool {
        !matches!(mode, RecoveryMode::BeforeError)
    }

    async fn recover(&self, state_machine_id: &str, options: &RecoveryOptions) -> PersistResult<RecoveryResult> {
        let Some((metadata, state)) = self.locate(state_machine_id, &options.mode).await? else {
            return Ok(RecoveryResult::failed(format!(
                "no snapshot of {} matches {}",
                state_machine_id, options.mode
            )));
        };

        let mut result = RecoveryResult::success(state.clone(), snapshot_point(&metadata, &state))
            .with_metadata("snapshot_id", metadata.snapshot_id.clone());
        if let RecoveryMode::PointInTime(at) = &options.mode {
            result = result.with_metadata("time_delta_seconds", (*at - metadata.created_at).num_seconds());
        }
        Ok(result)
    }
}

/// Whether an event marks an error in the state machine's history
fn is_error_event(event: &StateEvent) -> bool {
    match event.event_type {
        EventType::Error => true,
        EventType::Transitioned => event
            .parse_data::<StateTransition>()
            .map(|t| t.is_error())
            .unwrap_or(false),
        _ => false,
    }
}

/// Replays the event stream
///
/// A compacted stream is replayed on top of the snapshot covering its
/// compaction floor.
pub struct EventSourcedRecovery {
    events: Arc<EventStore>,
    snapshots: Option<Arc<SnapshotManager>>,
}

impl EventSourcedRecovery {
    pub fn new(events: Arc<EventStore>) -> Self {
        Self { events, snapshots: None }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotManager>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Events to replay for a mode
    fn select(events: Vec<StateEvent>, mode: &RecoveryMode) -> (Vec<StateEvent>, Option<u64>) {
        match mode {
            RecoveryMode::PointInTime(at) => (events.into_iter().filter(|e| e.timestamp <= *at).collect(), None),
            RecoveryMode::BeforeError => match events.iter().rposition(is_error_event) {
                Some(index) => {
                    let error_sequence = events[index].sequence_number;
                    let mut events = events;
                    events.truncate(index);
                    (events, Some(error_sequence))
                }
                None => (events, None),
            },
            _ => (events, None),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for EventSourcedRecovery {
    fn name(&self) -> &str {
        "event_sourced"
    }

    fn can_recover(&self, mode: &RecoveryMode) -> bool {
        !matches!(mode, RecoveryMode::Snapshot(_))
    }

    async fn recover(&self, state_machine_id: &str, options: &RecoveryOptions) -> PersistResult<RecoveryResult> {
        let floor = self.events.compacted_through(state_machine_id).await?;
        let all = self.events.get_events(state_machine_id, 0, None).await?;
        let (events, error_sequence) = Self::select(all, &options.mode);

        let mut seeded_from = None;
        let mut state = PersistedState::new(state_machine_id);
        if floor > 0 {
            let target = events.last().map(|e| e.sequence_number).unwrap_or(floor);
            let covering = match &self.snapshots {
                Some(snapshots) => snapshots.load_covering(state_machine_id, floor, target).await?,
                None => None,
            };
            let Some((metadata, base)) = covering else {
                return Ok(RecoveryResult::failed(format!(
                    "{} is compacted through {} and no snapshot covers it",
                    state_machine_id, floor
                )));
            };
            seeded_from = Some(metadata.snapshot_id);
            state = base;
        }

        let after = state.sequence_number().unwrap_or(0);
        let events: Vec<StateEvent> = events.into_iter().filter(|e| e.sequence_number > after).collect();
        if events.is_empty() && seeded_from.is_none() {
            return Ok(RecoveryResult::failed(format!(
                "no events of {} to replay for {}",
                state_machine_id, options.mode
            )));
        }

        let mut applied = 0usize;
        let mut failure = None;
        for event in &events {
            match self.events.apply_event(state.clone(), event) {
                Ok(next) => {
                    state = next;
                    applied += 1;
                }
                Err(e) => {
                    failure = Some((event.sequence_number, e));
                    break;
                }
            }
        }

        if state.is_deleted() {
            return Ok(RecoveryResult::failed(format!("{} has been deleted", state_machine_id)));
        }

        let last_sequence = state.sequence_number().unwrap_or(0);
        let mut point = RecoveryPoint::from_state(format!("events:{}:{}", state_machine_id, last_sequence), &state);
        point
            .metadata
            .insert("sequence_number".to_string(), Value::from(last_sequence));

        let mut result = match failure {
            None => RecoveryResult::success(state, point),
            Some((sequence, e)) => {
                tracing::warn!(
                    state_machine_id = %state_machine_id,
                    sequence,
                    error = %e,
                    "Replay stopped at failing event"
                );
                RecoveryResult::partial(state, point, e.to_string()).with_metadata("failed_sequence", sequence)
            }
        };
        result = result.with_metadata("events_applied", applied as u64);
        if let Some(snapshot_id) = seeded_from {
            result = result.with_metadata("snapshot_id", snapshot_id);
        }
        if let Some(sequence) = error_sequence {
            result = result.with_metadata("error_sequence", sequence);
        }
        Ok(result)
    }
}

/// Snapshot first, then the transitions logged after it
pub struct HybridRecovery {
    snapshots: SnapshotRecovery,
    transitions: Arc<TransitionLogger>,
    fallback: EventSourcedRecovery,
    clock: Arc<dyn Clock>,
    snapshot_age_threshold: Duration,
}

impl HybridRecovery {
    pub fn new(
        snapshots: Arc<SnapshotManager>,
        transitions: Arc<TransitionLogger>,
        events: Arc<EventStore>,
        snapshot_age_threshold: Duration,
    ) -> Self {
        Self {
            fallback: EventSourcedRecovery::new(events).with_snapshots(snapshots.clone()),
            snapshots: SnapshotRecovery::new(snapshots),
            transitions,
            clock: system_clock(),
            snapshot_age_threshold,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn fall_back(&self, state_machine_id: &str, options: &RecoveryOptions, reason: &str) -> PersistResult<RecoveryResult> {
        tracing::info!(
            state_machine_id = %state_machine_id,
            reason,
            "Hybrid recovery falling back to event replay"
        );
        Ok(self
            .fallback
            .recover(state_machine_id, options)
            .await?
            .with_metadata("fallback", "event_sourced"))
    }

    async fn replay_after(
        &self,
        state_machine_id: &str,
        metadata: &SnapshotMetadata,
        base: PersistedState,
        until: Option<DateTime<Utc>>,
    ) -> PersistResult<RecoveryResult> {
        let transitions = self
            .transitions
            .get_transitions(state_machine_id, Some(metadata.created_at), until, None)
            .await?;

        let mut state = base;
        let mut applied = 0u64;
        let mut failure = None;
        for transition in &transitions {
            let mut next = state.clone();
            match next.apply_transition(transition) {
                Ok(()) => {
                    state = next;
                    applied += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut point = snapshot_point(metadata, &state);
        point.timestamp = state.updated_at.max(metadata.created_at);
        point.transition_count = state.transitions.len();

        let result = match failure {
            None => RecoveryResult::success(state, point),
            Some(e) => {
                tracing::warn!(
                    state_machine_id = %state_machine_id,
                    applied,
                    error = %e,
                    "Transition replay stopped on top of snapshot"
                );
                RecoveryResult::partial(state, point, e.to_string())
            }
        };
        Ok(result
            .with_metadata("hybrid_recovery", true)
            .with_metadata("transitions_applied", applied)
            .with_metadata("snapshot_id", metadata.snapshot_id.clone()))
    }
}

#[async_trait]
impl RecoveryStrategy for HybridRecovery {
    fn name(&self) -> &str {
        "hybrid"
    }

    fn can_recover(&self, mode: &RecoveryMode) -> bool {
        !matches!(mode, RecoveryMode::BeforeError)
    }

    async fn recover(&self, state_machine_id: &str, options: &RecoveryOptions) -> PersistResult<RecoveryResult> {
        let located = match self.snapshots.locate(state_machine_id, &options.mode).await {
            Ok(located) => located,
            Err(e) => return self.fall_back(state_machine_id, options, &e.to_string()).await,
        };
        let Some((metadata, state)) = located else {
            return self.fall_back(state_machine_id, options, "no snapshot").await;
        };

        match &options.mode {
            RecoveryMode::Latest => {
                let age = self.clock.now() - metadata.created_at;
                if age < to_chrono(self.snapshot_age_threshold) {
                    let point = snapshot_point(&metadata, &state);
                    return Ok(RecoveryResult::success(state, point)
                        .with_metadata("hybrid_recovery", true)
                        .with_metadata("transitions_applied", 0u64)
                        .with_metadata("snapshot_id", metadata.snapshot_id.clone())
                        .with_metadata("snapshot_fresh", true));
                }
                self.replay_after(state_machine_id, &metadata, state, None).await
            }
            RecoveryMode::PointInTime(at) => self.replay_after(state_machine_id, &metadata, state, Some(*at)).await,
            // An explicitly chosen snapshot is returned as stored
            _ => {
                let point = snapshot_point(&metadata, &state);
                Ok(RecoveryResult::success(state, point)
                    .with_metadata("hybrid_recovery", true)
                    .with_metadata("transitions_applied", 0u64)
                    .with_metadata("snapshot_id", metadata.snapshot_id.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotConfig;
    use crate::recovery::RecoveryStatus;
    use crate::snapshot::InMemorySnapshotStore;
    use crate::transition_log::InMemoryTransitionStore;
    use crate::utils::FakeClock;
    use serde_json::json;

    fn playing(round: i64) -> PersistedState {
        let mut state = PersistedState::new("g1");
        state.current_state = "playing".to_string();
        state.state_data.insert("round".to_string(), json!(round));
        state
    }

    #[tokio::test]
    async fn test_snapshot_recovery_point_in_time_reports_delta() {
        let clock = FakeClock::new();
        let snapshots = Arc::new(
            SnapshotManager::new(vec![Arc::new(InMemorySnapshotStore::new())], SnapshotConfig::default())
                .with_clock(Arc::new(clock.clone())),
        );
        snapshots.create_snapshot("g1", &playing(1), vec![]).await.unwrap();
        let first_at = clock.now();
        clock.advance(chrono::Duration::minutes(10));
        snapshots.create_snapshot("g1", &playing(2), vec![]).await.unwrap();

        let recovery = SnapshotRecovery::new(snapshots);
        let target = first_at + chrono::Duration::minutes(5);
        let result = recovery
            .recover("g1", &RecoveryOptions::point_in_time(target))
            .await
            .unwrap();

        assert_eq!(result.status, RecoveryStatus::Success);
        assert_eq!(result.recovered_state.unwrap().get("round"), Some(&json!(1)));
        assert_eq!(result.metadata.get("time_delta_seconds"), Some(&json!(300)));

        let missing = recovery
            .recover("g1", &RecoveryOptions::point_in_time(first_at - chrono::Duration::minutes(1)))
            .await
            .unwrap();
        assert_eq!(missing.status, RecoveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_event_sourced_before_error() {
        let events = Arc::new(EventStore::new());
        events
            .append("g1", EventType::Created, json!({"current_state": "playing", "round": 1}), None, None)
            .await
            .unwrap();
        events.append("g1", EventType::Updated, json!({"round": 2}), None, None).await.unwrap();
        let broken = StateTransition::new("playing", "error", "desync").with_metadata("error", json!("hash mismatch"));
        events
            .append("g1", EventType::Transitioned, serde_json::to_value(&broken).unwrap(), None, None)
            .await
            .unwrap();

        let recovery = EventSourcedRecovery::new(events);
        let result = recovery.recover("g1", &RecoveryOptions::before_error()).await.unwrap();

        assert_eq!(result.status, RecoveryStatus::Success);
        let state = result.recovered_state.unwrap();
        assert_eq!(state.current_state, "playing");
        assert_eq!(state.get("round"), Some(&json!(2)));
        assert_eq!(result.metadata.get("error_sequence"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_event_sourced_partial_on_failing_transition() {
        let events = Arc::new(EventStore::new());
        events
            .append("g1", EventType::Created, json!({"current_state": "lobby"}), None, None)
            .await
            .unwrap();
        let wrong = StateTransition::new("playing", "ended", "finish");
        events
            .append("g1", EventType::Transitioned, serde_json::to_value(&wrong).unwrap(), None, None)
            .await
            .unwrap();

        let result = EventSourcedRecovery::new(events)
            .recover("g1", &RecoveryOptions::latest())
            .await
            .unwrap();

        assert_eq!(result.status, RecoveryStatus::Partial);
        assert_eq!(result.recovered_state.unwrap().current_state, "lobby");
        assert!(result.error.is_some());
        assert_eq!(result.metadata.get("failed_sequence"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_event_sourced_seeds_compacted_stream_from_snapshot() {
        let clock = FakeClock::new();
        let events = Arc::new(EventStore::new().with_clock(Arc::new(clock.clone())));
        events
            .append("g1", EventType::Created, json!({"current_state": "lobby", "players": 2}), None, None)
            .await
            .unwrap();
        let start = StateTransition::new("lobby", "playing", "start").with_field("round", json!(1));
        events
            .append("g1", EventType::Transitioned, serde_json::to_value(&start).unwrap(), None, None)
            .await
            .unwrap();

        let snapshots = Arc::new(
            SnapshotManager::new(vec![Arc::new(InMemorySnapshotStore::new())], SnapshotConfig::default())
                .with_clock(Arc::new(clock.clone())),
        );
        let covered = events.get_current_state("g1", 0).await.unwrap().unwrap();
        snapshots.create_snapshot("g1", &covered, vec![]).await.unwrap();
        events.mark_snapshot("g1", 2).await.unwrap();

        clock.advance(chrono::Duration::minutes(5));
        events.append("g1", EventType::Updated, json!({"round": 2}), None, None).await.unwrap();
        assert_eq!(events.compact("g1", clock.now()).await.unwrap(), 2);

        let unseeded = EventSourcedRecovery::new(events.clone())
            .recover("g1", &RecoveryOptions::latest())
            .await
            .unwrap();
        assert_eq!(unseeded.status, RecoveryStatus::Failed);

        let result = EventSourcedRecovery::new(events)
            .with_snapshots(snapshots)
            .recover("g1", &RecoveryOptions::latest())
            .await
            .unwrap();
        assert_eq!(result.status, RecoveryStatus::Success);
        let state = result.recovered_state.unwrap();
        assert_eq!(state.current_state, "playing");
        assert_eq!(state.get("players"), Some(&json!(2)));
        assert_eq!(state.get("round"), Some(&json!(2)));
        assert_eq!(result.metadata.get("events_applied"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_hybrid_falls_back_without_snapshot() {
        let events = Arc::new(EventStore::new());
        events
            .append("g1", EventType::Created, json!({"current_state": "playing", "round": 3}), None, None)
            .await
            .unwrap();
        let snapshots = Arc::new(SnapshotManager::new(
            vec![Arc::new(InMemorySnapshotStore::new())],
            SnapshotConfig::default(),
        ));
        let transitions = Arc::new(TransitionLogger::new(vec![Arc::new(InMemoryTransitionStore::new())]));

        let hybrid = HybridRecovery::new(snapshots, transitions, events, Duration::from_secs(60));
        let result = hybrid.recover("g1", &RecoveryOptions::latest()).await.unwrap();

        assert_eq!(result.status, RecoveryStatus::Success);
        assert_eq!(result.metadata.get("fallback"), Some(&json!("event_sourced")));
        assert_eq!(result.recovered_state.unwrap().get("round"), Some(&json!(3)));
    }
}

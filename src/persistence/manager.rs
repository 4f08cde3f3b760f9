//! Persistence Manager - the engine's façade
//!
//! Picks one persistence strategy at build time, keeps a bounded
//! write-through cache in front of it and runs the background workers:
//!
//! - batch: persists pending ids once they are due
//! - archival sweep: queues every known id for compaction
//! - archiver: compacts old transitions and events from the queue
//! - maintenance: expires cache entries and rotates transition logs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::cache::StateCache;
use super::metrics::PersistenceMetrics;
use super::policy::{AutoPersistencePolicy, PersistAction};
use super::strategy::{
    EventSourcedStrategy, HybridStrategy, PersistenceStrategy, SnapshotOnlyStrategy, VersionedStrategy,
};
use crate::config::{PersistenceConfig, RecoveryConfig, SnapshotConfig, StrategyKind, TransitionLogConfig};
use crate::error::{PersistError, PersistResult};
use crate::event_store::EventStore;
use crate::recovery::{
    EventSourcedRecovery, HybridRecovery, RecoveryManager, RecoveryOptions, RecoveryStrategy, SnapshotRecovery,
};
use crate::snapshot::{FileSnapshotStore, SnapshotManager};
use crate::storage::{FileBackend, StorageBackend};
use crate::transition_log::{FileTransitionStore, TransitionLogger};
use crate::types::{PersistedState, StateData, StateTransition, StateVersion};
use crate::utils::{system_clock, to_chrono, Clock};
use crate::versioning::{MigrationRunner, StateVersionManager};

/// A state waiting for the batch worker
struct PendingSave {
    state: PersistedState,
    due_at: DateTime<Utc>,
}

/// Wires components into a `PersistenceManager`
pub struct PersistenceManagerBuilder {
    config: PersistenceConfig,
    recovery_config: RecoveryConfig,
    clock: Arc<dyn Clock>,
    events: Option<Arc<EventStore>>,
    snapshots: Option<Arc<SnapshotManager>>,
    transitions: Option<Arc<TransitionLogger>>,
    rotation: Option<Arc<FileTransitionStore>>,
    versions: Option<Arc<StateVersionManager>>,
    recovery: Option<Arc<RecoveryManager>>,
}

impl PersistenceManagerBuilder {
    pub fn new(config: PersistenceConfig) -> Self {
        Self {
            config,
            recovery_config: RecoveryConfig::default(),
            clock: system_clock(),
            events: None,
            snapshots: None,
            transitions: None,
            rotation: None,
            versions: None,
            recovery: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn event_store(mut self, events: Arc<EventStore>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn snapshots(mut self, snapshots: Arc<SnapshotManager>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn transitions(mut self, transitions: Arc<TransitionLogger>) -> Self {
        self.transitions = Some(transitions);
        self
    }

    /// File log rotated by the maintenance worker
    pub fn rotation(mut self, store: Arc<FileTransitionStore>) -> Self {
        self.rotation = Some(store);
        self
    }

    pub fn versions(mut self, versions: Arc<StateVersionManager>) -> Self {
        self.versions = Some(versions);
        self
    }

    /// Replaces the recovery manager derived from the other components
    pub fn recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn recovery_config(mut self, config: RecoveryConfig) -> Self {
        self.recovery_config = config;
        self
    }

    fn missing(kind: StrategyKind, component: &str) -> PersistError {
        PersistError::Configuration(format!("{} persistence requires {}", kind, component))
    }

    fn strategy(&self) -> PersistResult<Arc<dyn PersistenceStrategy>> {
        let kind = self.config.strategy;
        let strategy: Arc<dyn PersistenceStrategy> = match kind {
            StrategyKind::SnapshotOnly => {
                let snapshots = self.snapshots.clone().ok_or_else(|| Self::missing(kind, "a snapshot manager"))?;
                Arc::new(
                    SnapshotOnlyStrategy::new(snapshots, self.config.snapshot_interval).with_clock(self.clock.clone()),
                )
            }
            StrategyKind::EventSourced => {
                let events = self.events.clone().ok_or_else(|| Self::missing(kind, "an event store"))?;
                let strategy = EventSourcedStrategy::new(events);
                match self.snapshots.clone() {
                    Some(snapshots) => Arc::new(strategy.with_snapshots(snapshots)),
                    None => Arc::new(strategy),
                }
            }
            StrategyKind::Hybrid => {
                let events = self.events.clone().ok_or_else(|| Self::missing(kind, "an event store"))?;
                let snapshots = self.snapshots.clone().ok_or_else(|| Self::missing(kind, "a snapshot manager"))?;
                Arc::new(HybridStrategy::new(events, snapshots))
            }
            StrategyKind::Versioned => {
                let versions = self.versions.clone().ok_or_else(|| Self::missing(kind, "a version manager"))?;
                Arc::new(VersionedStrategy::new(versions))
            }
        };
        Ok(strategy)
    }

    /// Recovery strategies for whatever components are present
    fn derived_recovery(&self) -> Option<Arc<RecoveryManager>> {
        let mut strategies: Vec<Arc<dyn RecoveryStrategy>> = Vec::new();
        if let (Some(snapshots), Some(transitions), Some(events)) = (&self.snapshots, &self.transitions, &self.events) {
            strategies.push(Arc::new(
                HybridRecovery::new(
                    snapshots.clone(),
                    transitions.clone(),
                    events.clone(),
                    self.recovery_config.snapshot_age_threshold,
                )
                .with_clock(self.clock.clone()),
            ));
        }
        if let Some(snapshots) = &self.snapshots {
            strategies.push(Arc::new(SnapshotRecovery::new(snapshots.clone())));
        }
        if let Some(events) = &self.events {
            let replay = EventSourcedRecovery::new(events.clone());
            strategies.push(match &self.snapshots {
                Some(snapshots) => Arc::new(replay.with_snapshots(snapshots.clone())),
                None => Arc::new(replay),
            });
        }

        let default = strategies.first()?.clone();
        let mut manager = RecoveryManager::new(self.recovery_config.clone())
            .with_clock(self.clock.clone())
            .with_default_strategy(default);
        for strategy in strategies {
            manager = manager.with_strategy(strategy);
        }
        if let Some(snapshots) = &self.snapshots {
            manager = manager.with_snapshots(snapshots.clone());
        }
        Some(Arc::new(manager))
    }

    /// Validate the components against the strategy and build
    pub fn build(self) -> PersistResult<PersistenceManager> {
        let strategy = self.strategy()?;
        let recovery = self.recovery.clone().or_else(|| self.derived_recovery());
        let (archive_tx, archive_rx) = mpsc::channel(self.config.archive_queue_capacity.max(1));
        let (cancel, _) = watch::channel(false);

        tracing::info!(
            strategy = %strategy.kind(),
            cache_size = self.config.cache_size,
            "Persistence manager ready"
        );

        Ok(PersistenceManager {
            inner: Arc::new(ManagerInner {
                cache: Mutex::new(StateCache::new(self.config.cache_size, self.config.cache_ttl)),
                config: self.config,
                strategy,
                events: self.events,
                snapshots: self.snapshots,
                transitions: self.transitions,
                rotation: self.rotation,
                recovery,
                pending: Mutex::new(HashMap::new()),
                metrics: PersistenceMetrics::new(),
                clock: self.clock,
                archive_tx,
            }),
            archive_rx: Mutex::new(Some(archive_rx)),
            cancel,
            workers: Mutex::new(Vec::new()),
        })
    }
}

struct ManagerInner {
    config: PersistenceConfig,
    strategy: Arc<dyn PersistenceStrategy>,
    events: Option<Arc<EventStore>>,
    snapshots: Option<Arc<SnapshotManager>>,
    transitions: Option<Arc<TransitionLogger>>,
    rotation: Option<Arc<FileTransitionStore>>,
    recovery: Option<Arc<RecoveryManager>>,
    cache: Mutex<StateCache>,
    pending: Mutex<HashMap<String, PendingSave>>,
    metrics: PersistenceMetrics,
    clock: Arc<dyn Clock>,
    archive_tx: mpsc::Sender<String>,
}

impl ManagerInner {
    /// Count a failure against the id before handing it back
    fn track<T>(&self, state_machine_id: &str, result: PersistResult<T>) -> PersistResult<T> {
        if let Err(e) = &result {
            self.metrics.record_failure(state_machine_id);
            tracing::error!(state_machine_id = %state_machine_id, error = %e, "Persistence operation failed");
        }
        result
    }

    fn cache_put(&self, state_machine_id: &str, state: PersistedState) {
        let evicted = self.cache.lock().put(state_machine_id, state, self.clock.now());
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "Evicted cached states");
        }
    }

    fn mark_pending(&self, state_machine_id: &str, state: PersistedState, due_at: DateTime<Utc>) {
        let mut pending = self.pending.lock();
        let due_at = pending
            .get(state_machine_id)
            .map(|p| p.due_at.min(due_at))
            .unwrap_or(due_at);
        pending.insert(state_machine_id.to_string(), PendingSave { state, due_at });
    }

    /// Persist one state; the cache only sees it once the write succeeded
    async fn persist(&self, state_machine_id: &str, state: &PersistedState) -> PersistResult<String> {
        let started = Instant::now();
        let result = self.strategy.save(state_machine_id, state).await;
        self.settle(state_machine_id, state, started.elapsed(), result)
    }

    /// Bookkeeping after a save attempt
    ///
    /// A failed save evicts the id, so the next load goes to storage.
    fn settle(
        &self,
        state_machine_id: &str,
        state: &PersistedState,
        elapsed: Duration,
        result: PersistResult<String>,
    ) -> PersistResult<String> {
        let save_id = match self.track(state_machine_id, result) {
            Ok(save_id) => save_id,
            Err(e) => {
                self.cache.lock().remove(state_machine_id);
                return Err(e);
            }
        };

        let bytes = serde_json::to_vec(state).map(|b| b.len() as u64).unwrap_or(0);
        self.metrics.record_save(state_machine_id, elapsed, bytes);
        self.pending.lock().remove(state_machine_id);
        self.cache_put(state_machine_id, state.clone());
        tracing::debug!(state_machine_id = %state_machine_id, save_id = %save_id, "Persisted state");
        Ok(save_id)
    }

    async fn load(&self, state_machine_id: &str, version: Option<&StateVersion>) -> PersistResult<Option<PersistedState>> {
        if version.is_none() {
            let cached = self.cache.lock().get(state_machine_id, self.clock.now());
            if let Some(state) = cached {
                self.metrics.record_cache_hit(state_machine_id);
                return Ok(Some(state));
            }
            self.metrics.record_cache_miss(state_machine_id);
        }

        let started = Instant::now();
        let result = self.strategy.load(state_machine_id, version).await;
        let loaded = self.track(state_machine_id, result)?;
        self.metrics.record_load(state_machine_id, started.elapsed());

        if let (None, Some(state)) = (version, &loaded) {
            self.cache_put(state_machine_id, state.clone());
        }
        Ok(loaded)
    }

    /// Persist pending states; only those already due unless `all`
    async fn persist_pending(&self, all: bool) -> usize {
        let now = self.clock.now();
        let batch: Vec<(String, PersistedState)> = {
            let pending = self.pending.lock();
            let mut due: Vec<(&String, &PendingSave)> = pending
                .iter()
                .filter(|(_, p)| all || p.due_at <= now)
                .collect();
            due.sort_by_key(|(_, p)| p.due_at);
            let limit = if all { usize::MAX } else { self.config.batch_size.max(1) };
            due.into_iter()
                .take(limit)
                .map(|(id, p)| (id.clone(), p.state.clone()))
                .collect()
        };

        if batch.is_empty() {
            return 0;
        }

        let started = Instant::now();
        let results = self.strategy.save_batch(&batch).await;
        let elapsed = started.elapsed() / batch.len() as u32;
        let mut persisted = 0;
        for ((state_machine_id, state), result) in batch.iter().zip(results) {
            if self.settle(state_machine_id, state, elapsed, result).is_ok() {
                persisted += 1;
            }
        }
        if persisted > 0 {
            tracing::debug!(persisted, "Persisted pending states");
        }
        persisted
    }

    /// Queue every known id for archival; returns how many were queued
    async fn sweep_archive(&self) -> usize {
        let mut ids = Vec::new();
        if let Some(transitions) = &self.transitions {
            match transitions.list_state_machine_ids().await {
                Ok(listed) => ids.extend(listed),
                Err(e) => tracing::warn!(error = %e, "Archive sweep could not list transition logs"),
            }
        }
        if let Some(events) = &self.events {
            match events.list_stream_ids().await {
                Ok(listed) => ids.extend(listed),
                Err(e) => tracing::warn!(error = %e, "Archive sweep could not list event streams"),
            }
        }
        ids.sort();
        ids.dedup();

        let mut queued = 0;
        for id in ids {
            match self.archive_tx.try_send(id) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(id)) => {
                    tracing::error!(state_machine_id = %id, "Archive queue full, dropping item");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        queued
    }

    /// Compact transitions and snapshot-covered events older than `archive_after`
    async fn archive(&self, state_machine_id: &str) -> PersistResult<usize> {
        let cutoff = self.clock.now() - to_chrono(self.config.archive_after);
        let mut removed = 0;
        if let Some(transitions) = &self.transitions {
            removed += transitions.compact_log(state_machine_id, cutoff).await?;
        }
        if let Some(events) = &self.events {
            removed += events.compact(state_machine_id, cutoff).await?;
        }
        if removed > 0 {
            tracing::info!(state_machine_id = %state_machine_id, removed, "Archived old history");
        }
        Ok(removed)
    }

    async fn maintain(&self) {
        let expired = self.cache.lock().expire(self.clock.now());
        if expired > 0 {
            tracing::debug!(expired, "Expired cached states");
        }
        if let Some(rotation) = &self.rotation {
            if let Err(e) = rotation.rotate_all().await {
                tracing::warn!(error = %e, "Transition log rotation failed");
            }
        }
    }
}

/// Façade over the persistence engine
pub struct PersistenceManager {
    inner: Arc<ManagerInner>,
    archive_rx: Mutex<Option<mpsc::Receiver<String>>>,
    cancel: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistenceManager {
    pub fn builder(config: PersistenceConfig) -> PersistenceManagerBuilder {
        PersistenceManagerBuilder::new(config)
    }

    /// File-backed engine rooted at `config.data_dir`
    ///
    /// Events and versions share one document backend; snapshots and
    /// transition logs get their own directories.
    pub async fn open(config: PersistenceConfig) -> PersistResult<Self> {
        let documents: Arc<dyn StorageBackend> = Arc::new(FileBackend::open(config.documents_dir()).await?);
        let snapshot_store = Arc::new(FileSnapshotStore::open(config.snapshots_dir()).await?);
        let transition_store = Arc::new(FileTransitionStore::open(TransitionLogConfig::new(config.transitions_dir())).await?);

        let events = Arc::new(EventStore::new().with_backend(documents.clone()));
        let snapshots = Arc::new(SnapshotManager::new(
            vec![snapshot_store],
            SnapshotConfig {
                snapshot_interval: config.snapshot_interval,
                ..Default::default()
            },
        ));
        let transitions = Arc::new(TransitionLogger::new(vec![transition_store.clone()]));
        let versions = Arc::new(StateVersionManager::new(
            documents,
            Arc::new(MigrationRunner::new()),
            StateVersion::initial(),
        ));

        tracing::info!(data_dir = %config.data_dir.display(), "Opening file-backed persistence");
        Self::builder(config)
            .event_store(events)
            .snapshots(snapshots)
            .transitions(transitions)
            .rotation(transition_store)
            .versions(versions)
            .build()
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.inner.config
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.inner.strategy.kind()
    }

    pub fn metrics(&self) -> &PersistenceMetrics {
        &self.inner.metrics
    }

    pub fn event_store(&self) -> Option<&Arc<EventStore>> {
        self.inner.events.as_ref()
    }

    pub fn snapshot_manager(&self) -> Option<&Arc<SnapshotManager>> {
        self.inner.snapshots.as_ref()
    }

    pub fn transition_logger(&self) -> Option<&Arc<TransitionLogger>> {
        self.inner.transitions.as_ref()
    }

    pub fn recovery_manager(&self) -> Option<&Arc<RecoveryManager>> {
        self.inner.recovery.as_ref()
    }

    pub fn cached_count(&self) -> usize {
        self.inner.cache.lock().len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Cache `state` and persist it unless the strategy says not yet
    ///
    /// Returns the save id, or `None` when the save was deferred to the
    /// batch worker.
    pub async fn save_state(
        &self,
        state_machine_id: &str,
        state: PersistedState,
        force: bool,
    ) -> PersistResult<Option<String>> {
        let inner = &self.inner;
        if !force && !inner.strategy.should_persist(state_machine_id) {
            let due_at = inner.clock.now() + to_chrono(inner.config.snapshot_interval);
            inner.cache_put(state_machine_id, state.clone());
            inner.mark_pending(state_machine_id, state, due_at);
            tracing::debug!(state_machine_id = %state_machine_id, "Save deferred");
            return Ok(None);
        }
        inner.persist(state_machine_id, &state).await.map(Some)
    }

    /// Persist under an explicit version
    pub async fn save_state_version(
        &self,
        state_machine_id: &str,
        state: PersistedState,
        version: StateVersion,
    ) -> PersistResult<String> {
        let inner = &self.inner;
        let started = Instant::now();
        let result = inner.strategy.save_version(state_machine_id, &state, version).await;
        let save_id = inner.track(state_machine_id, result)?;

        let bytes = serde_json::to_vec(&state).map(|b| b.len() as u64).unwrap_or(0);
        inner.metrics.record_save(state_machine_id, started.elapsed(), bytes);
        inner.pending.lock().remove(state_machine_id);
        inner.cache.lock().remove(state_machine_id);
        Ok(save_id)
    }

    /// The latest state (cache first) or a specific version
    pub async fn load_state(
        &self,
        state_machine_id: &str,
        version: Option<&StateVersion>,
    ) -> PersistResult<Option<PersistedState>> {
        self.inner.load(state_machine_id, version).await
    }

    pub async fn delete_state(&self, state_machine_id: &str) -> PersistResult<bool> {
        let inner = &self.inner;
        inner.cache.lock().remove(state_machine_id);
        inner.pending.lock().remove(state_machine_id);

        let result = inner.strategy.delete(state_machine_id).await;
        let deleted = inner.track(state_machine_id, result)?;
        tracing::info!(state_machine_id = %state_machine_id, deleted, "Deleted state");
        Ok(deleted)
    }

    pub async fn list_versions(&self, state_machine_id: &str) -> PersistResult<Vec<StateVersion>> {
        let result = self.inner.strategy.list_versions(state_machine_id).await;
        self.inner.track(state_machine_id, result)
    }

    /// Snapshot the current state; empty when there is no state
    ///
    /// A pending save is flushed first, so the snapshot covers exactly the
    /// event stream's current version and can back compaction.
    pub async fn create_snapshot(&self, state_machine_id: &str) -> PersistResult<Vec<String>> {
        let inner = &self.inner;
        let Some(snapshots) = inner.snapshots.clone() else {
            return inner.track(
                state_machine_id,
                Err(PersistError::Configuration("no snapshot manager configured".to_string())),
            );
        };

        let pending = inner.pending.lock().remove(state_machine_id);
        if let Some(pending) = pending {
            inner.persist(state_machine_id, &pending.state).await?;
        }
        let Some(mut state) = inner.load(state_machine_id, None).await? else {
            return Ok(Vec::new());
        };

        let sequence = match &inner.events {
            Some(events) => {
                let version = events.stream_version(state_machine_id).await;
                inner.track(state_machine_id, version)?
            }
            None => 0,
        };
        if sequence > 0 {
            state.set_sequence_number(sequence);
        }

        let result = snapshots
            .create_snapshot(state_machine_id, &state, vec!["manual".to_string()])
            .await;
        let ids = inner.track(state_machine_id, result)?;

        if let (Some(events), true) = (&inner.events, sequence > 0) {
            let marked = events.mark_snapshot(state_machine_id, sequence).await;
            inner.track(state_machine_id, marked)?;
        }
        Ok(ids)
    }

    /// Recover through the recovery manager and cache the result
    ///
    /// `None` when recovery produced no usable state.
    pub async fn recover_state(
        &self,
        state_machine_id: &str,
        options: Option<RecoveryOptions>,
    ) -> PersistResult<Option<PersistedState>> {
        let inner = &self.inner;
        let Some(recovery) = inner.recovery.clone() else {
            return inner.track(
                state_machine_id,
                Err(PersistError::Configuration("no recovery strategies available".to_string())),
            );
        };

        let result = recovery
            .recover(state_machine_id, options.unwrap_or_default())
            .await;
        let result = inner.track(state_machine_id, result)?;

        if !result.is_usable() {
            tracing::warn!(
                state_machine_id = %state_machine_id,
                status = ?result.status,
                error = ?result.error,
                "Recovery produced no usable state"
            );
            return Ok(None);
        }
        let state = result.recovered_state;
        if let Some(state) = &state {
            inner.cache_put(state_machine_id, state.clone());
        }
        Ok(state)
    }

    /// Apply a transition to the current state, log it and persist per `policy`
    pub async fn handle_transition(
        &self,
        state_machine_id: &str,
        transition: StateTransition,
        policy: &AutoPersistencePolicy,
    ) -> PersistResult<PersistedState> {
        let inner = &self.inner;
        let mut state = inner
            .load(state_machine_id, None)
            .await?
            .unwrap_or_else(|| PersistedState::new(state_machine_id));
        let applied = state.apply_transition(&transition);
        inner.track(state_machine_id, applied)?;

        if let Some(transitions) = &inner.transitions {
            let logged = transitions.log_transition(state_machine_id, transition.clone()).await;
            inner.track(state_machine_id, logged)?;
        }
        let recorded = inner.strategy.record_transition(state_machine_id, &transition).await;
        if let Err(e) = inner.track(state_machine_id, recorded) {
            inner.cache.lock().remove(state_machine_id);
            return Err(e);
        }

        self.apply_policy(state_machine_id, &state, policy.for_transition(&transition), policy)
            .await?;
        Ok(state)
    }

    /// Merge fields into the current state and persist per `policy`
    pub async fn handle_update(
        &self,
        state_machine_id: &str,
        fields: &StateData,
        policy: &AutoPersistencePolicy,
    ) -> PersistResult<PersistedState> {
        let inner = &self.inner;
        let mut state = inner
            .load(state_machine_id, None)
            .await?
            .unwrap_or_else(|| PersistedState::new(state_machine_id));
        state.merge_fields(fields, inner.clock.now());

        self.apply_policy(state_machine_id, &state, policy.for_update(), policy)
            .await?;
        Ok(state)
    }

    async fn apply_policy(
        &self,
        state_machine_id: &str,
        state: &PersistedState,
        action: PersistAction,
        policy: &AutoPersistencePolicy,
    ) -> PersistResult<()> {
        let inner = &self.inner;
        match action {
            PersistAction::Immediate => {
                inner.persist(state_machine_id, state).await?;
            }
            PersistAction::Defer => {
                let delay = policy.interval.unwrap_or(Duration::ZERO);
                inner.cache_put(state_machine_id, state.clone());
                inner.mark_pending(state_machine_id, state.clone(), inner.clock.now() + to_chrono(delay));
            }
            PersistAction::None => {
                inner.cache_put(state_machine_id, state.clone());
            }
        }
        Ok(())
    }

    /// Persist pending states that are due, at most `batch_size` of them
    pub async fn persist_due(&self) -> usize {
        self.inner.persist_pending(false).await
    }

    /// Persist every pending state regardless of due time
    pub async fn flush_pending(&self) -> usize {
        self.inner.persist_pending(true).await
    }

    /// Queue every known id for archival
    pub async fn sweep_archive(&self) -> usize {
        self.inner.sweep_archive().await
    }

    /// Compact the history of one state machine now
    pub async fn archive_state(&self, state_machine_id: &str) -> PersistResult<usize> {
        let result = self.inner.archive(state_machine_id).await;
        self.inner.track(state_machine_id, result)
    }

    /// Spawn the background workers; later calls are no-ops
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        let config = &self.inner.config;

        workers.push(spawn_periodic(
            "batch",
            config.batch_interval,
            self.cancel.subscribe(),
            self.inner.clone(),
            |inner| async move {
                inner.persist_pending(false).await;
            },
        ));
        workers.push(spawn_periodic(
            "archive_sweep",
            config.archive_interval,
            self.cancel.subscribe(),
            self.inner.clone(),
            |inner| async move {
                inner.sweep_archive().await;
            },
        ));
        workers.push(spawn_periodic(
            "maintenance",
            config.cache_sweep_interval,
            self.cancel.subscribe(),
            self.inner.clone(),
            |inner| async move {
                inner.maintain().await;
            },
        ));

        if let Some(rx) = self.archive_rx.lock().take() {
            workers.push(spawn_archiver(rx, self.cancel.subscribe(), self.inner.clone()));
        }
        tracing::info!(workers = workers.len(), "Started persistence workers");
    }

    /// Flush pending saves, then stop and await every worker
    pub async fn shutdown(&self) {
        let flushed = self.flush_pending().await;
        self.cancel.send_replace(true);

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Persistence worker ended abnormally");
            }
        }
        tracing::info!(flushed, "Persistence manager shut down");
    }
}

/// Run `task` every `period` until cancelled
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut cancel: watch::Receiver<bool>,
    inner: Arc<ManagerInner>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<ManagerInner>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => task(inner.clone()).await,
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker = name, "Worker stopped");
    })
}

fn spawn_archiver(
    mut rx: mpsc::Receiver<String>,
    mut cancel: watch::Receiver<bool>,
    inner: Arc<ManagerInner>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                item = rx.recv() => match item {
                    Some(id) => {
                        let result = inner.archive(&id).await;
                        if let Err(e) = inner.track(&id, result) {
                            tracing::warn!(state_machine_id = %id, error = %e, "Archival failed");
                        }
                    }
                    None => break,
                },
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker = "archiver", "Worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::InMemorySnapshotStore;
    use crate::transition_log::InMemoryTransitionStore;
    use crate::utils::FakeClock;
    use serde_json::json;

    fn playing(round: i64) -> PersistedState {
        let raw = json!({"current_state": "playing", "round": round});
        PersistedState::from_raw("g1", raw.as_object().unwrap())
    }

    fn components(clock: Arc<FakeClock>) -> (Arc<EventStore>, Arc<SnapshotManager>, Arc<TransitionLogger>) {
        let events = Arc::new(EventStore::new().with_clock(clock.clone()));
        let snapshots = Arc::new(
            SnapshotManager::new(vec![Arc::new(InMemorySnapshotStore::new())], SnapshotConfig::default())
                .with_clock(clock.clone()),
        );
        let transitions = Arc::new(TransitionLogger::new(vec![Arc::new(InMemoryTransitionStore::new())]).with_clock(clock));
        (events, snapshots, transitions)
    }

    #[test]
    fn test_missing_components_fail_at_build() {
        let err = PersistenceManager::builder(PersistenceConfig::new(StrategyKind::Hybrid))
            .event_store(Arc::new(EventStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PersistError::Configuration(_)));

        assert!(PersistenceManager::builder(PersistenceConfig::new(StrategyKind::Versioned))
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn test_snapshot_only_defers_within_interval() {
        let clock = Arc::new(FakeClock::new());
        let (_, snapshots, _) = components(clock.clone());
        let manager = PersistenceManager::builder(PersistenceConfig::new(StrategyKind::SnapshotOnly))
            .snapshots(snapshots)
            .clock(clock.clone())
            .build()
            .unwrap();

        assert!(manager.save_state("g1", playing(1), false).await.unwrap().is_some());
        assert!(manager.save_state("g1", playing(2), false).await.unwrap().is_none());
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.persist_due().await, 0);

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(manager.persist_due().await, 1);
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.metrics().snapshot().saves, 2);
    }

    #[tokio::test]
    async fn test_cache_hits_and_failure_counters() {
        let clock = Arc::new(FakeClock::new());
        let (events, _, _) = components(clock.clone());
        let manager = PersistenceManager::builder(PersistenceConfig::new(StrategyKind::EventSourced))
            .event_store(events)
            .clock(clock)
            .build()
            .unwrap();

        manager.save_state("g1", playing(1), true).await.unwrap();
        manager.load_state("g1", None).await.unwrap().unwrap();
        assert!(manager.load_state("g2", None).await.unwrap().is_none());

        let metrics = manager.metrics().snapshot();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);

        let bad = StateTransition::new("lobby", "playing", "start");
        assert!(manager
            .handle_transition("g1", bad, &AutoPersistencePolicy::default())
            .await
            .is_err());
        assert_eq!(manager.metrics().for_state_machine("g1").unwrap().failures, 1);
        assert!(manager.create_snapshot("g1").await.is_err());
    }

    #[tokio::test]
    async fn test_transition_policy_and_shutdown_flush() {
        let clock = Arc::new(FakeClock::new());
        let (events, snapshots, transitions) = components(clock.clone());
        let manager = PersistenceManager::builder(PersistenceConfig::new(StrategyKind::Hybrid))
            .event_store(events.clone())
            .snapshots(snapshots)
            .transitions(transitions.clone())
            .clock(clock)
            .build()
            .unwrap();
        let policy = AutoPersistencePolicy::default().with_interval(Duration::from_secs(3600));

        manager.save_state("g1", playing(1), true).await.unwrap();
        let state = manager
            .handle_transition(
                "g1",
                StateTransition::new("playing", "playing", "score").with_field("round", json!(2)),
                &policy,
            )
            .await
            .unwrap();
        assert_eq!(state.get("round"), Some(&json!(2)));
        assert_eq!(manager.pending_count(), 1);

        manager
            .handle_transition("g1", StateTransition::new("playing", "finished", "end"), &policy)
            .await
            .unwrap();
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(transitions.get_transitions("g1", None, None, None).await.unwrap().len(), 2);

        manager
            .handle_update("g1", json!({"spectators": 3}).as_object().unwrap(), &AutoPersistencePolicy {
                on_update: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(manager.pending_count(), 1);

        manager.start();
        manager.shutdown().await;
        assert_eq!(manager.pending_count(), 0);

        let stored = events.get_current_state("g1", 0).await.unwrap().unwrap();
        assert_eq!(stored.current_state, "finished");
        assert_eq!(stored.get("spectators"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_snapshot_from_cache_marks_event_stream() {
        let clock = Arc::new(FakeClock::new());
        let (events, snapshots, _) = components(clock.clone());
        let manager = PersistenceManager::builder(PersistenceConfig::new(StrategyKind::EventSourced))
            .event_store(events.clone())
            .snapshots(snapshots.clone())
            .clock(clock)
            .build()
            .unwrap();

        manager.save_state("g1", playing(1), true).await.unwrap();
        manager.save_state("g1", playing(2), true).await.unwrap();
        assert_eq!(manager.cached_count(), 1);

        manager.create_snapshot("g1").await.unwrap();
        let stream = events.get_stream("g1").await.unwrap();
        assert_eq!(stream.last_snapshot_version, 2);

        let latest = snapshots.latest_metadata("g1").await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, Some(2));
    }

    #[tokio::test]
    async fn test_archive_queue_drops_when_full() {
        let clock = Arc::new(FakeClock::new());
        let (events, _, transitions) = components(clock.clone());
        let config = PersistenceConfig {
            archive_queue_capacity: 1,
            ..PersistenceConfig::new(StrategyKind::EventSourced)
        };
        let manager = PersistenceManager::builder(config)
            .event_store(events)
            .transitions(transitions)
            .clock(clock)
            .build()
            .unwrap();

        manager.save_state("g1", playing(1), true).await.unwrap();
        manager.save_state("g2", playing(1), true).await.unwrap();
        assert_eq!(manager.sweep_archive().await, 1);
    }
}

//! Versioned state storage over a generic backend
//!
//! Every save lands under `versions/<id>/<major>.<minor>.<patch>`. A save
//! whose version is not newer than the stored latest is a write race and
//! goes through the conflict resolver; loads migrate states whose embedded
//! schema is older than the current one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use super::conflict::{ConflictResolver, VersionConflictResolver, VersionedState};
use super::runner::MigrationRunner;
use crate::error::{PersistError, PersistResult};
use crate::storage::StorageBackend;
use crate::types::{PersistedState, StateVersion};
use crate::utils::{system_clock, Clock};

const VERSION_PREFIX: &str = "versions/";

fn versions_prefix(state_machine_id: &str) -> String {
    format!("{}{}/", VERSION_PREFIX, state_machine_id)
}

fn version_key(state_machine_id: &str, version: &StateVersion) -> String {
    format!(
        "{}{:010}.{:010}.{:010}",
        versions_prefix(state_machine_id),
        version.major,
        version.minor,
        version.patch
    )
}

fn parse_version_key(key: &str) -> Option<StateVersion> {
    let (_, tail) = key.rsplit_once('/')?;
    let mut parts = tail.split('.').map(|p| p.parse::<u32>());
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) => Some(StateVersion::new(major, minor, patch)),
        _ => None,
    }
}

pub struct StateVersionManager {
    backend: Arc<dyn StorageBackend>,
    runner: Arc<MigrationRunner>,
    resolver: Arc<dyn ConflictResolver>,
    current_schema: StateVersion,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl StateVersionManager {
    pub fn new(backend: Arc<dyn StorageBackend>, runner: Arc<MigrationRunner>, current_schema: StateVersion) -> Self {
        Self {
            backend,
            runner,
            resolver: Arc::new(VersionConflictResolver::default()),
            current_schema,
            clock: system_clock(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn current_schema(&self) -> &StateVersion {
        &self.current_schema
    }

    pub fn runner(&self) -> &Arc<MigrationRunner> {
        &self.runner
    }

    fn lock_for(&self, state_machine_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(state_machine_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Stored versions, oldest first
    pub async fn list_versions(&self, state_machine_id: &str) -> PersistResult<Vec<StateVersion>> {
        let keys = self.backend.list_prefix(&versions_prefix(state_machine_id)).await?;
        let mut versions: Vec<StateVersion> = keys.iter().filter_map(|k| parse_version_key(k)).collect();
        versions.sort();
        Ok(versions)
    }

    async fn read(&self, state_machine_id: &str, version: &StateVersion) -> PersistResult<Option<VersionedState>> {
        match self.backend.get(&version_key(state_machine_id, version)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, record: &VersionedState) -> PersistResult<()> {
        let key = version_key(&record.state_machine_id, &record.version);
        self.backend.set(&key, serde_json::to_value(record)?).await
    }

    /// Persist a state and return the version it was stored under
    ///
    /// Without an explicit version the next patch after the stored latest
    /// is used. An explicit version at or below the stored latest is a
    /// conflict; the resolved state is stored one patch above the higher of
    /// the two.
    pub async fn save(
        &self,
        state_machine_id: &str,
        mut state: PersistedState,
        version: Option<StateVersion>,
    ) -> PersistResult<StateVersion> {
        let lock = self.lock_for(state_machine_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        if state.schema_version().is_none() {
            state.set_schema_version(&self.current_schema);
        }

        let latest = self.list_versions(state_machine_id).await?.pop();
        let mut record = match (latest, version) {
            (None, requested) => {
                let version = requested.unwrap_or_else(|| state.version.clone());
                VersionedState {
                    state_machine_id: state_machine_id.to_string(),
                    version: version.with_timestamp(now),
                    state,
                    saved_at: now,
                }
            }
            (Some(latest), None) => VersionedState {
                state_machine_id: state_machine_id.to_string(),
                version: latest.bump_patch().with_timestamp(now),
                state,
                saved_at: now,
            },
            (Some(latest), Some(requested)) if requested > latest => VersionedState {
                state_machine_id: state_machine_id.to_string(),
                version: requested.with_timestamp(now),
                state,
                saved_at: now,
            },
            (Some(latest), Some(requested)) => {
                let existing = self.read(state_machine_id, &latest).await?.ok_or_else(|| {
                    PersistError::storage(format!("version {} of {} vanished", latest, state_machine_id))
                })?;
                let incoming = VersionedState {
                    state_machine_id: state_machine_id.to_string(),
                    version: requested.clone(),
                    state,
                    saved_at: now,
                };

                tracing::warn!(
                    state_machine_id = %state_machine_id,
                    stored = %latest,
                    incoming = %requested,
                    resolver = self.resolver.name(),
                    "Version conflict on save"
                );
                let mut resolved = self.resolver.resolve(&existing, incoming)?;
                resolved.version = latest.max(requested).bump_patch().with_timestamp(now);
                resolved.saved_at = now;
                resolved
            }
        };

        record.state.version = record.version.clone();
        self.write(&record).await?;

        tracing::debug!(state_machine_id = %state_machine_id, version = %record.version, "Saved state version");
        Ok(record.version)
    }

    /// Save several states at their next patch versions in one backend write
    ///
    /// `None`, with nothing written, when the backend has no batch writes.
    /// Ids must be distinct within a batch.
    pub async fn save_many(&self, batch: Vec<(String, PersistedState)>) -> PersistResult<Option<Vec<StateVersion>>> {
        let Some(writer) = self.backend.as_batch_writer() else {
            return Ok(None);
        };

        let mut ids: Vec<String> = batch.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != batch.len() {
            return Err(PersistError::ValidationFailure(
                "a batch may hold each state machine only once".to_string(),
            ));
        }

        // Locks are taken in sorted id order
        let locks: Vec<Arc<AsyncMutex<()>>> = ids.iter().map(|id| self.lock_for(id)).collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }

        let now = self.clock.now();
        let mut records = Vec::with_capacity(batch.len());
        for (state_machine_id, mut state) in batch {
            if state.schema_version().is_none() {
                state.set_schema_version(&self.current_schema);
            }
            let version = match self.list_versions(&state_machine_id).await?.pop() {
                Some(latest) => latest.bump_patch(),
                None => state.version.clone(),
            }
            .with_timestamp(now);
            state.version = version.clone();
            records.push(VersionedState {
                state_machine_id,
                version,
                state,
                saved_at: now,
            });
        }

        let entries = records
            .iter()
            .map(|r| Ok((version_key(&r.state_machine_id, &r.version), serde_json::to_value(r)?)))
            .collect::<PersistResult<Vec<_>>>()?;
        writer.set_many(entries).await?;
        drop(guards);

        tracing::debug!(saved = records.len(), "Saved state versions in one batch");
        Ok(Some(records.into_iter().map(|r| r.version).collect()))
    }

    /// Load the latest or a specific version, migrating old schemas
    pub async fn load(
        &self,
        state_machine_id: &str,
        version: Option<&StateVersion>,
    ) -> PersistResult<Option<PersistedState>> {
        let target = match version {
            Some(v) => Some(v.clone()),
            None => self.list_versions(state_machine_id).await?.pop(),
        };
        let Some(target) = target else {
            return Ok(None);
        };
        let Some(record) = self.read(state_machine_id, &target).await? else {
            return Ok(None);
        };

        let mut state = record.state;
        if let Some(schema) = state.schema_version() {
            if schema < self.current_schema {
                state.state_data = self.runner.migrate(state.state_data, &schema, &self.current_schema)?;
                state.set_schema_version(&self.current_schema);
                tracing::info!(
                    state_machine_id = %state_machine_id,
                    from = %schema,
                    to = %self.current_schema,
                    "Migrated state on load"
                );
            }
        }
        Ok(Some(state))
    }

    /// Remove every stored version; returns whether anything existed
    pub async fn delete(&self, state_machine_id: &str) -> PersistResult<bool> {
        let lock = self.lock_for(state_machine_id);
        let _guard = lock.lock().await;

        let mut removed = false;
        for key in self.backend.list_prefix(&versions_prefix(state_machine_id)).await? {
            removed |= self.backend.delete(&key).await?;
        }
        Ok(removed)
    }

    /// Make `version` the latest again by dropping every newer version
    ///
    /// This is the only operation that moves the latest version backwards.
    /// Returns `None`, leaving storage untouched, when `version` was never
    /// stored.
    pub async fn rollback_to(
        &self,
        state_machine_id: &str,
        version: &StateVersion,
    ) -> PersistResult<Option<PersistedState>> {
        {
            let lock = self.lock_for(state_machine_id);
            let _guard = lock.lock().await;

            if self.read(state_machine_id, version).await?.is_none() {
                return Ok(None);
            }
            let newer: Vec<StateVersion> = self
                .list_versions(state_machine_id)
                .await?
                .into_iter()
                .filter(|v| v > version)
                .collect();
            for v in &newer {
                self.backend.delete(&version_key(state_machine_id, v)).await?;
            }
            tracing::info!(
                state_machine_id = %state_machine_id,
                version = %version,
                dropped = newer.len(),
                "Rolled back state"
            );
        }
        self.load(state_machine_id, Some(version)).await
    }
}

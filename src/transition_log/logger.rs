//! Transition Logger - the ops-facing audit trail
//!
//! Every transition is classified, sequenced and appended to each backing
//! store, then fed to the pattern analyzer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Mutex as AsyncMutex;

use super::analyzer::PatternAnalyzer;
use super::query::{TransitionQuery, TransitionRecord};
use super::store::TransitionStore;
use crate::error::{PersistError, PersistResult};
use crate::types::{PersistedState, StateTransition, TransitionType};
use crate::utils::{system_clock, Clock};

pub struct TransitionLogger {
    stores: Vec<Arc<dyn TransitionStore>>,
    analyzer: Arc<PatternAnalyzer>,
    clock: Arc<dyn Clock>,
    sequences: AsyncMutex<HashMap<String, u64>>,
}

impl TransitionLogger {
    pub fn new(stores: Vec<Arc<dyn TransitionStore>>) -> Self {
        Self {
            stores,
            analyzer: Arc::new(PatternAnalyzer::default()),
            clock: system_clock(),
            sequences: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<PatternAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn analyzer(&self) -> &Arc<PatternAnalyzer> {
        &self.analyzer
    }

    pub fn stores(&self) -> &[Arc<dyn TransitionStore>] {
        &self.stores
    }

    async fn highest_stored_sequence(&self, state_machine_id: &str) -> u64 {
        let mut highest = 0;
        for store in &self.stores {
            match store.last_sequence(state_machine_id).await {
                Ok(seq) => highest = highest.max(seq),
                Err(e) => {
                    tracing::warn!(store = store.name(), error = %e, "Failed to read transition sequence");
                }
            }
        }
        highest
    }

    /// Classify, sequence and append a transition to every store
    ///
    /// Fails only when no store accepted the record.
    pub async fn log_transition(
        &self,
        state_machine_id: &str,
        transition: StateTransition,
    ) -> PersistResult<TransitionRecord> {
        if self.stores.is_empty() {
            return Err(PersistError::Configuration(
                "transition logger has no stores".to_string(),
            ));
        }

        let record = {
            let mut sequences = self.sequences.lock().await;
            let last = match sequences.get(state_machine_id) {
                Some(seq) => *seq,
                None => self.highest_stored_sequence(state_machine_id).await,
            };

            let record = TransitionRecord {
                state_machine_id: state_machine_id.to_string(),
                sequence: last + 1,
                transition_type: TransitionType::classify(&transition),
                transition,
                logged_at: self.clock.now(),
            };

            let results = join_all(self.stores.iter().map(|store| store.append(&record))).await;
            let mut accepted = 0;
            let mut last_error = None;
            for (store, result) in self.stores.iter().zip(results) {
                match result {
                    Ok(()) => accepted += 1,
                    Err(e) => {
                        tracing::warn!(
                            store = store.name(),
                            state_machine_id = %state_machine_id,
                            error = %e,
                            "Transition store rejected record"
                        );
                        last_error = Some(e);
                    }
                }
            }
            if accepted == 0 {
                return Err(last_error.unwrap_or_else(|| PersistError::storage("no transition store succeeded")));
            }

            sequences.insert(state_machine_id.to_string(), record.sequence);
            record
        };

        for anomaly in self
            .analyzer
            .observe(state_machine_id, &record.transition, record.logged_at)
        {
            tracing::warn!(
                state_machine_id = %state_machine_id,
                anomaly = ?anomaly.kind,
                "Transition anomaly detected"
            );
        }

        tracing::debug!(
            state_machine_id = %state_machine_id,
            sequence = record.sequence,
            transition_type = %record.transition_type,
            action = %record.transition.action,
            "Logged transition"
        );
        Ok(record)
    }

    /// Query the first store that answers
    pub async fn query(
        &self,
        state_machine_id: &str,
        query: &TransitionQuery,
    ) -> PersistResult<Vec<TransitionRecord>> {
        let mut last_error = None;
        for store in &self.stores {
            match store.query(state_machine_id, query).await {
                Ok(records) => return Ok(records),
                Err(e) => {
                    tracing::warn!(store = store.name(), error = %e, "Transition store query failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    /// Transitions with `after < timestamp <= until`, oldest first
    pub async fn get_transitions(
        &self,
        state_machine_id: &str,
        after: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> PersistResult<Vec<StateTransition>> {
        let query = TransitionQuery::new().between(after, until).limit(limit);
        Ok(self
            .query(state_machine_id, &query)
            .await?
            .into_iter()
            .map(|r| r.transition)
            .collect())
    }

    /// Apply transitions in order on top of `base`
    ///
    /// Pure: the same base and transitions always give the same state.
    pub fn replay_transitions(
        base: &PersistedState,
        transitions: &[StateTransition],
    ) -> PersistResult<PersistedState> {
        let mut state = base.clone();
        for transition in transitions {
            state.apply_transition(transition)?;
        }
        Ok(state)
    }

    /// Remove log entries older than `before` from every store
    ///
    /// Returns the largest count removed by any single store.
    pub async fn compact_log(&self, state_machine_id: &str, before: DateTime<Utc>) -> PersistResult<usize> {
        let mut removed = 0;
        for store in &self.stores {
            removed = removed.max(store.compact(state_machine_id, before).await?);
        }
        self.analyzer.prune(state_machine_id, before);
        Ok(removed)
    }

    pub async fn delete_log(&self, state_machine_id: &str) -> PersistResult<usize> {
        let mut removed = 0;
        for store in &self.stores {
            removed = removed.max(store.delete_all(state_machine_id).await?);
        }
        self.sequences.lock().await.remove(state_machine_id);
        self.analyzer.reset(state_machine_id);
        Ok(removed)
    }

    /// Ids with at least one logged transition in any store
    pub async fn list_state_machine_ids(&self) -> PersistResult<Vec<String>> {
        let mut ids = Vec::new();
        for store in &self.stores {
            ids.extend(store.list_ids().await?);
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

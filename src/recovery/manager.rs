//! Recovery Manager
//!
//! Picks a strategy for the requested mode, runs it under a per-attempt
//! timeout, validates the result and keeps a bounded attempt history.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::strategy::RecoveryStrategy;
use super::types::{RecoveryAttempt, RecoveryOptions, RecoveryResult, RecoveryStatus};
use super::validator::{StateValidator, StructuralValidator};
use crate::config::RecoveryConfig;
use crate::error::{PersistError, PersistResult};
use crate::snapshot::SnapshotManager;
use crate::types::RecoveryPoint;
use crate::utils::{system_clock, Clock};

pub struct RecoveryManager {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    default_strategy: Option<Arc<dyn RecoveryStrategy>>,
    snapshots: Option<Arc<SnapshotManager>>,
    config: RecoveryConfig,
    clock: Arc<dyn Clock>,
    history: Mutex<VecDeque<RecoveryAttempt>>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            strategies: Vec::new(),
            default_strategy: None,
            snapshots: None,
            config,
            clock: system_clock(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Strategies are consulted in registration order
    pub fn with_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Used when no registered strategy accepts the mode
    pub fn with_default_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    /// Source of snapshot recovery points
    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotManager>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn select(&self, options: &RecoveryOptions) -> Option<Arc<dyn RecoveryStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.can_recover(&options.mode))
            .cloned()
            .or_else(|| self.default_strategy.clone())
    }

    async fn run_once(
        &self,
        strategy: &dyn RecoveryStrategy,
        state_machine_id: &str,
        options: &RecoveryOptions,
    ) -> Option<PersistResult<RecoveryResult>> {
        match self.config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, strategy.recover(state_machine_id, options))
                .await
                .ok(),
            None => Some(strategy.recover(state_machine_id, options).await),
        }
    }

    /// Recover a state machine
    ///
    /// Returns `RecoveryNotPossible` when no strategy applies or every
    /// attempt timed out; corruption errors are returned as-is. Any other
    /// failure ends as a `Failed` result.
    pub async fn recover(&self, state_machine_id: &str, options: RecoveryOptions) -> PersistResult<RecoveryResult> {
        let mut attempt = RecoveryAttempt::new(state_machine_id, options.mode.clone(), self.clock.now());

        let Some(strategy) = self.select(&options) else {
            attempt.advance(RecoveryStatus::Failed, self.clock.now())?;
            attempt.error = Some("no strategy can recover this mode".to_string());
            self.record(attempt);
            return Err(PersistError::RecoveryNotPossible(format!(
                "no recovery strategy handles {} for {}",
                options.mode, state_machine_id
            )));
        };

        attempt.strategy = Some(strategy.name().to_string());
        attempt.advance(RecoveryStatus::InProgress, self.clock.now())?;
        tracing::info!(
            state_machine_id = %state_machine_id,
            strategy = strategy.name(),
            mode = %options.mode,
            "Starting recovery"
        );

        let max_tries = self.config.max_attempts.max(1);
        let mut outcome: Option<RecoveryResult> = None;
        let mut timeouts = 0;

        for _ in 0..max_tries {
            attempt.tries += 1;
            match self.run_once(strategy.as_ref(), state_machine_id, &options).await {
                None => {
                    timeouts += 1;
                    tracing::warn!(state_machine_id = %state_machine_id, try_number = attempt.tries, "Recovery attempt timed out");
                }
                Some(Ok(result)) if result.status != RecoveryStatus::Failed => {
                    outcome = Some(result);
                    break;
                }
                Some(Ok(failed)) => outcome = Some(failed),
                Some(Err(e)) if e.is_corruption() => {
                    attempt.error = Some(e.to_string());
                    attempt.advance(RecoveryStatus::Failed, self.clock.now())?;
                    self.record(attempt);
                    return Err(e);
                }
                Some(Err(e)) => {
                    tracing::warn!(state_machine_id = %state_machine_id, error = %e, "Recovery attempt failed");
                    outcome = Some(RecoveryResult::failed(e.to_string()));
                }
            }
        }

        let Some(mut result) = outcome else {
            attempt.error = Some(format!("timed out after {} attempts", timeouts));
            attempt.advance(RecoveryStatus::Failed, self.clock.now())?;
            self.record(attempt);
            return Err(PersistError::RecoveryNotPossible(format!(
                "recovery of {} timed out after {} attempts",
                state_machine_id, timeouts
            )));
        };

        if options.validate.unwrap_or(self.config.validate_by_default) {
            self.validate(&mut result, &options);
        }

        result = result
            .with_metadata("strategy", strategy.name().to_string())
            .with_metadata("attempts", attempt.tries);

        attempt.error = result.error.clone();
        attempt.recovery_point = result.recovery_point.clone();
        attempt.advance(result.status, self.clock.now())?;

        tracing::info!(
            state_machine_id = %state_machine_id,
            strategy = strategy.name(),
            status = ?result.status,
            "Recovery finished"
        );
        self.record(attempt);
        Ok(result)
    }

    /// Downgrade `Success` to `Partial` when the recovered state is invalid
    fn validate(&self, result: &mut RecoveryResult, options: &RecoveryOptions) {
        let Some(state) = &result.recovered_state else {
            return;
        };
        let structural = StructuralValidator;
        let validator: &dyn StateValidator = match &options.validator {
            Some(custom) => custom.as_ref(),
            None => &structural,
        };

        if let Err(e) = validator.validate(state) {
            tracing::warn!(
                state_machine_id = %state.state_machine_id,
                validator = validator.name(),
                error = %e,
                "Recovered state failed validation"
            );
            if result.status == RecoveryStatus::Success {
                result.status = RecoveryStatus::Partial;
            }
            result.error = Some(e.to_string());
            result
                .metadata
                .insert("validation_failed".to_string(), true.into());
        }
    }

    fn record(&self, attempt: RecoveryAttempt) {
        let mut history = self.history.lock();
        history.push_back(attempt);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Recorded attempts of one state machine, oldest first
    pub fn history(&self, state_machine_id: &str) -> Vec<RecoveryAttempt> {
        self.history
            .lock()
            .iter()
            .filter(|a| a.state_machine_id == state_machine_id)
            .cloned()
            .collect()
    }

    /// Snapshot points plus points reached by past recoveries, newest first
    pub async fn recovery_points(&self, state_machine_id: &str) -> PersistResult<Vec<RecoveryPoint>> {
        let mut points = match &self.snapshots {
            Some(snapshots) => snapshots.list_snapshots(state_machine_id, None).await?,
            None => Vec::new(),
        };
        for attempt in self.history(state_machine_id) {
            if let Some(point) = attempt.recovery_point {
                if !points.iter().any(|p| p.recovery_id == point.recovery_id) {
                    points.push(point);
                }
            }
        }
        points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(points)
    }
}

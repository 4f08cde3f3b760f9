//! Recovery modes, options, results and attempt bookkeeping

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::validator::StateValidator;
use crate::error::{PersistError, PersistResult};
use crate::types::{PersistedState, RecoveryPoint, StateData};

/// What to recover to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "target", rename_all = "snake_case")]
pub enum RecoveryMode {
    /// The most recent state
    Latest,
    /// A specific snapshot
    Snapshot(String),
    /// The newest state at or before an instant
    PointInTime(DateTime<Utc>),
    /// The state right before the last error-flagged transition
    BeforeError,
}

impl std::fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryMode::Latest => write!(f, "latest"),
            RecoveryMode::Snapshot(id) => write!(f, "snapshot:{}", id),
            RecoveryMode::PointInTime(at) => write!(f, "point_in_time:{}", at.to_rfc3339()),
            RecoveryMode::BeforeError => write!(f, "before_error"),
        }
    }
}

/// Lifecycle of a recovery attempt
///
/// `Pending -> InProgress -> {Success | Partial | Failed}`; never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    InProgress,
    Success,
    Partial,
    Failed,
}

impl RecoveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecoveryStatus::Success | RecoveryStatus::Partial | RecoveryStatus::Failed
        )
    }

    pub fn can_advance_to(self, next: RecoveryStatus) -> bool {
        matches!(
            (self, next),
            (RecoveryStatus::Pending, RecoveryStatus::InProgress)
                | (RecoveryStatus::Pending, RecoveryStatus::Failed)
                | (RecoveryStatus::InProgress, RecoveryStatus::Success)
                | (RecoveryStatus::InProgress, RecoveryStatus::Partial)
                | (RecoveryStatus::InProgress, RecoveryStatus::Failed)
        )
    }
}

/// How a recovery should be performed
#[derive(Clone, Default)]
pub struct RecoveryOptions {
    pub mode: RecoveryMode,
    /// Validate the recovered state; `None` uses the manager default
    pub validate: Option<bool>,
    /// Replaces the structural validator when set
    pub validator: Option<Arc<dyn StateValidator>>,
}

impl Default for RecoveryMode {
    fn default() -> Self {
        RecoveryMode::Latest
    }
}

impl std::fmt::Debug for RecoveryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOptions")
            .field("mode", &self.mode)
            .field("validate", &self.validate)
            .field("validator", &self.validator.as_ref().map(|v| v.name().to_string()))
            .finish()
    }
}

impl RecoveryOptions {
    pub fn new(mode: RecoveryMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn latest() -> Self {
        Self::new(RecoveryMode::Latest)
    }

    pub fn snapshot(snapshot_id: impl Into<String>) -> Self {
        Self::new(RecoveryMode::Snapshot(snapshot_id.into()))
    }

    pub fn point_in_time(at: DateTime<Utc>) -> Self {
        Self::new(RecoveryMode::PointInTime(at))
    }

    pub fn before_error() -> Self {
        Self::new(RecoveryMode::BeforeError)
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = Some(validate);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn StateValidator>) -> Self {
        self.validator = Some(validator);
        self.validate = Some(true);
        self
    }
}

/// Outcome of one recovery
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub status: RecoveryStatus,
    pub recovered_state: Option<PersistedState>,
    pub recovery_point: Option<RecoveryPoint>,
    pub error: Option<String>,
    pub metadata: StateData,
}

impl RecoveryResult {
    pub fn success(state: PersistedState, recovery_point: RecoveryPoint) -> Self {
        Self {
            status: RecoveryStatus::Success,
            recovered_state: Some(state),
            recovery_point: Some(recovery_point),
            error: None,
            metadata: StateData::new(),
        }
    }

    /// State recovered up to a failure
    pub fn partial(state: PersistedState, recovery_point: RecoveryPoint, error: impl Into<String>) -> Self {
        Self {
            status: RecoveryStatus::Partial,
            recovered_state: Some(state),
            recovery_point: Some(recovery_point),
            error: Some(error.into()),
            metadata: StateData::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RecoveryStatus::Failed,
            recovered_state: None,
            recovery_point: None,
            error: Some(error.into()),
            metadata: StateData::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.status, RecoveryStatus::Success | RecoveryStatus::Partial)
            && self.recovered_state.is_some()
    }
}

/// One entry of the recovery history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub attempt_id: String,
    pub state_machine_id: String,
    pub mode: RecoveryMode,
    pub status: RecoveryStatus,
    pub strategy: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tries: u32,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_point: Option<RecoveryPoint>,
}

impl RecoveryAttempt {
    pub fn new(state_machine_id: &str, mode: RecoveryMode, started_at: DateTime<Utc>) -> Self {
        Self {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            state_machine_id: state_machine_id.to_string(),
            mode,
            status: RecoveryStatus::Pending,
            strategy: None,
            started_at,
            finished_at: None,
            tries: 0,
            error: None,
            recovery_point: None,
        }
    }

    /// Move to `next`, refusing backwards or repeated transitions
    pub fn advance(&mut self, next: RecoveryStatus, at: DateTime<Utc>) -> PersistResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(PersistError::ValidationFailure(format!(
                "recovery attempt {} cannot move from {:?} to {:?}",
                self.attempt_id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_never_goes_back() {
        let now = Utc::now();
        let mut attempt = RecoveryAttempt::new("g1", RecoveryMode::Latest, now);

        assert!(attempt.advance(RecoveryStatus::Success, now).is_err());
        attempt.advance(RecoveryStatus::InProgress, now).unwrap();
        assert!(attempt.advance(RecoveryStatus::Pending, now).is_err());
        attempt.advance(RecoveryStatus::Partial, now).unwrap();
        assert_eq!(attempt.finished_at, Some(now));
        assert!(attempt.advance(RecoveryStatus::InProgress, now).is_err());
        assert!(attempt.advance(RecoveryStatus::Success, now).is_err());
    }

    #[test]
    fn test_options_builders() {
        let options = RecoveryOptions::before_error().with_validation(false);
        assert_eq!(options.mode, RecoveryMode::BeforeError);
        assert_eq!(options.validate, Some(false));
        assert_eq!(RecoveryOptions::default().mode, RecoveryMode::Latest);
    }
}

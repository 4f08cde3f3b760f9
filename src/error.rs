//! Error types for the persistence engine

use thiserror::Error;

use crate::types::StateVersion;

/// Result type for engine operations
pub type PersistResult<T> = Result<T, PersistError>;

/// Errors that can occur anywhere in the engine
#[derive(Debug, Error)]
pub enum PersistError {
    /// Backend I/O failed
    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Loaded or recovered state is missing required fields
    #[error("validation failure: {0}")]
    ValidationFailure(String),

    /// Snapshot body does not match its stored checksum
    #[error("checksum mismatch for snapshot {snapshot_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        snapshot_id: String,
        expected: String,
        actual: String,
    },

    /// The event log of a state machine has a hole
    #[error("sequence gap in {state_machine_id}: expected {expected}, found {found}")]
    SequenceGapDetected {
        state_machine_id: String,
        expected: u64,
        found: u64,
    },

    /// A rebuild needs events that were compacted and no snapshot covers them
    #[error("event stream {state_machine_id} is compacted through {compacted_through} and no snapshot covers it")]
    StreamCompacted {
        state_machine_id: String,
        compacted_through: u64,
    },

    #[error("no migration path from {from} to {to}")]
    MigrationPathNotFound { from: StateVersion, to: StateVersion },

    #[error("invalid migration chain: {0}")]
    InvalidMigrationChain(String),

    #[error("recovery not possible: {0}")]
    RecoveryNotPossible(String),

    #[error("unresolved version conflict for {state_machine_id}: stored {existing}, incoming {incoming}")]
    ConflictUnresolved {
        state_machine_id: String,
        existing: StateVersion,
        incoming: StateVersion,
    },

    /// A component required by the chosen configuration is missing
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::StorageFailure(format!("IO error: {}", e))
    }
}

impl PersistError {
    /// Corruption is reported to operators and never repaired automatically
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            PersistError::ChecksumMismatch { .. } | PersistError::SequenceGapDetected { .. }
        )
    }

    pub fn storage(context: impl std::fmt::Display) -> Self {
        PersistError::StorageFailure(context.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_maps_to_storage_failure() {
        let err: PersistError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, PersistError::StorageFailure(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_corruption_classification() {
        let gap = PersistError::SequenceGapDetected {
            state_machine_id: "g1".to_string(),
            expected: 3,
            found: 5,
        };
        assert!(gap.is_corruption());
        assert!(!PersistError::ValidationFailure("x".to_string()).is_corruption());
        assert_eq!(gap.to_string(), "sequence gap in g1: expected 3, found 5");
    }
}

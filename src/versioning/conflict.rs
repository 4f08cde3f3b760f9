//! Resolution of concurrent saves of one state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PersistError, PersistResult};
use crate::types::{version::as_string, PersistedState, StateVersion};
use crate::utils::deep_merge;

/// One stored version of a state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedState {
    pub state_machine_id: String,
    #[serde(with = "as_string")]
    pub version: StateVersion,
    pub state: PersistedState,
    pub saved_at: DateTime<Utc>,
}

/// Reconciles a stored version with an incoming one that raced it
pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self, existing: &VersionedState, incoming: VersionedState) -> PersistResult<VersionedState>;
}

/// Built-in resolution strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionConflictResolver {
    /// Keep whichever side carries the higher version; the incoming side wins ties
    #[default]
    UseLatest,
    /// Always keep the incoming state
    UseIncoming,
    /// Recursively merge, incoming wins scalar collisions
    Merge,
    /// Refuse and leave it to the caller
    Manual,
}

impl ConflictResolver for VersionConflictResolver {
    fn name(&self) -> &str {
        match self {
            VersionConflictResolver::UseLatest => "use_latest",
            VersionConflictResolver::UseIncoming => "use_incoming",
            VersionConflictResolver::Merge => "merge",
            VersionConflictResolver::Manual => "manual",
        }
    }

    fn resolve(&self, existing: &VersionedState, incoming: VersionedState) -> PersistResult<VersionedState> {
        match self {
            VersionConflictResolver::UseLatest => {
                if incoming.version >= existing.version {
                    Ok(incoming)
                } else {
                    Ok(existing.clone())
                }
            }
            VersionConflictResolver::UseIncoming => Ok(incoming),
            VersionConflictResolver::Merge => {
                let mut merged = existing.state.clone();
                deep_merge(&mut merged.state_data, &incoming.state.state_data);
                deep_merge(&mut merged.metadata, &incoming.state.metadata);
                if !incoming.state.current_state.is_empty() {
                    merged.current_state = incoming.state.current_state.clone();
                }
                merged.updated_at = merged.updated_at.max(incoming.state.updated_at);

                Ok(VersionedState {
                    state_machine_id: incoming.state_machine_id,
                    version: existing.version.clone().max(incoming.version),
                    state: merged,
                    saved_at: incoming.saved_at,
                })
            }
            VersionConflictResolver::Manual => Err(PersistError::ConflictUnresolved {
                state_machine_id: incoming.state_machine_id,
                existing: existing.version.clone(),
                incoming: incoming.version,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn versioned(patch: u32, data: serde_json::Value) -> VersionedState {
        let raw = data.as_object().cloned().unwrap();
        VersionedState {
            state_machine_id: "g1".to_string(),
            version: StateVersion::new(1, 0, patch),
            state: PersistedState::from_raw("g1", &raw),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_use_latest_compares_versions() {
        let existing = versioned(5, json!({"round": 5}));
        let older = versioned(3, json!({"round": 3}));
        let resolved = VersionConflictResolver::UseLatest.resolve(&existing, older).unwrap();
        assert_eq!(resolved.state.get("round"), Some(&json!(5)));

        let same = versioned(5, json!({"round": 6}));
        let resolved = VersionConflictResolver::UseLatest.resolve(&existing, same).unwrap();
        assert_eq!(resolved.state.get("round"), Some(&json!(6)));
    }

    #[test]
    fn test_merge_favors_incoming_scalars() {
        let existing = versioned(5, json!({"current_state": "lobby", "round": 5, "scores": {"a": 1}}));
        let incoming = versioned(4, json!({"current_state": "playing", "round": 6, "scores": {"b": 2}}));
        let resolved = VersionConflictResolver::Merge.resolve(&existing, incoming).unwrap();

        assert_eq!(resolved.version, StateVersion::new(1, 0, 5));
        assert_eq!(resolved.state.current_state, "playing");
        assert_eq!(resolved.state.get("round"), Some(&json!(6)));
        assert_eq!(resolved.state.get("scores"), Some(&json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_manual_always_fails() {
        let existing = versioned(1, json!({}));
        let incoming = versioned(1, json!({}));
        assert!(matches!(
            VersionConflictResolver::Manual.resolve(&existing, incoming),
            Err(PersistError::ConflictUnresolved { .. })
        ));
    }
}

//! Materialized state and recovery points

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{StateData, StateTransition, StateVersion};
use crate::error::{PersistError, PersistResult};
use crate::utils::deep_merge;

/// Keys of a raw state map that describe the state itself rather than its data
pub const RESERVED_KEYS: &[&str] = &[
    "state_machine_id",
    "state_type",
    "current_state",
    "state_data",
    "version",
    "transitions",
    "metadata",
    "created_at",
    "updated_at",
];

/// Default `state_type` for states created from raw maps
pub const DEFAULT_STATE_TYPE: &str = "game";

/// The materialized view of a state machine returned to callers
///
/// Under event sourcing this is derived by projection and is not itself
/// authoritative; it can be evicted and rebuilt at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub state_machine_id: String,
    pub state_type: String,
    pub current_state: String,
    #[serde(default)]
    pub state_data: StateData,
    #[serde(default)]
    pub version: StateVersion,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: StateData,
}

impl PersistedState {
    /// An empty state with no current state and no data
    pub fn new(state_machine_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            state_machine_id: state_machine_id.into(),
            state_type: DEFAULT_STATE_TYPE.to_string(),
            current_state: String::new(),
            state_data: StateData::new(),
            version: StateVersion::initial(),
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: StateData::new(),
        }
    }

    /// Build a state from a raw map such as `{"current_state": "playing", "round": 1}`
    ///
    /// A nested `state_data` object is used as-is; otherwise every
    /// non-reserved key becomes part of `state_data`.
    pub fn from_raw(state_machine_id: impl Into<String>, raw: &StateData) -> Self {
        let mut state = Self::new(state_machine_id);
        state.overlay_raw(raw);
        state
    }

    /// Overlay the recognised fields of a raw map onto this state
    fn overlay_raw(&mut self, raw: &StateData) {
        if let Some(current) = raw.get("current_state").and_then(Value::as_str) {
            self.current_state = current.to_string();
        }
        if let Some(kind) = raw.get("state_type").and_then(Value::as_str) {
            self.state_type = kind.to_string();
        }
        if let Some(Value::Object(metadata)) = raw.get("metadata") {
            deep_merge(&mut self.metadata, metadata);
        }
        if let Some(version) = raw.get("version").and_then(parse_version_value) {
            self.version = version;
        }

        match raw.get("state_data") {
            Some(Value::Object(data)) => deep_merge(&mut self.state_data, data),
            _ => {
                for (key, value) in raw {
                    if !RESERVED_KEYS.contains(&key.as_str()) {
                        merge_value(&mut self.state_data, key, value);
                    }
                }
            }
        }
    }

    /// Flatten into a raw map: `state_data` fields plus `current_state` and `state_type`
    pub fn to_raw(&self) -> StateData {
        let mut raw = self.state_data.clone();
        raw.insert("current_state".to_string(), Value::String(self.current_state.clone()));
        raw.insert("state_type".to_string(), Value::String(self.state_type.clone()));
        raw
    }

    /// Merge arbitrary fields into the state (the `Updated` event semantics)
    pub fn merge_fields(&mut self, fields: &StateData, at: DateTime<Utc>) {
        self.overlay_raw(fields);
        self.updated_at = at;
    }

    /// Apply one transition: move to `to_state` and merge the payload
    ///
    /// Fails when the transition does not start from the current state.
    /// An empty current state (nothing applied yet) and a `*` source accept
    /// any transition.
    pub fn apply_transition(&mut self, transition: &StateTransition) -> PersistResult<()> {
        let from = transition.from_state.as_str();
        if !self.current_state.is_empty() && !from.is_empty() && from != "*" && from != self.current_state {
            return Err(PersistError::ValidationFailure(format!(
                "transition '{}' expects state '{}' but {} is in '{}'",
                transition.action, from, self.state_machine_id, self.current_state
            )));
        }

        self.current_state = transition.to_state.clone();
        deep_merge(&mut self.state_data, &transition.payload);
        self.transitions.push(transition.clone());
        if transition.timestamp > self.updated_at {
            self.updated_at = transition.timestamp;
        }
        Ok(())
    }

    /// Read a `state_data` field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state_data.get(key)
    }

    /// Schema version embedded in the metadata, if any
    pub fn schema_version(&self) -> Option<StateVersion> {
        self.metadata
            .get("schema_version")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
    }

    pub fn set_schema_version(&mut self, version: &StateVersion) {
        self.metadata
            .insert("schema_version".to_string(), Value::String(version.to_string()));
    }

    /// Event sequence number this state was projected up to
    pub fn sequence_number(&self) -> Option<u64> {
        self.metadata.get("sequence_number").and_then(Value::as_u64)
    }

    pub fn set_sequence_number(&mut self, sequence: u64) {
        self.metadata
            .insert("sequence_number".to_string(), Value::from(sequence));
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.metadata.get("deleted"), Some(Value::Bool(true)))
    }
}

fn merge_value(target: &mut StateData, key: &str, value: &Value) {
    match (target.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => deep_merge(existing, incoming),
        _ => {
            target.insert(key.to_string(), value.clone());
        }
    }
}

fn parse_version_value(value: &Value) -> Option<StateVersion> {
    match value {
        Value::String(raw) => raw.parse().ok(),
        Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}

/// A strategy-agnostic place recovery can resume from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub recovery_id: String,
    pub state_machine_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_snapshot: Option<PersistedState>,
    pub transition_count: usize,
    #[serde(default)]
    pub metadata: StateData,
}

impl RecoveryPoint {
    pub fn new(recovery_id: impl Into<String>, state_machine_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            recovery_id: recovery_id.into(),
            state_machine_id: state_machine_id.into(),
            timestamp,
            state_snapshot: None,
            transition_count: 0,
            metadata: StateData::new(),
        }
    }

    /// Point at a materialized state
    pub fn from_state(recovery_id: impl Into<String>, state: &PersistedState) -> Self {
        Self {
            recovery_id: recovery_id.into(),
            state_machine_id: state.state_machine_id.clone(),
            timestamp: state.updated_at,
            state_snapshot: Some(state.clone()),
            transition_count: state.transitions.len(),
            metadata: StateData::new(),
        }
    }
}

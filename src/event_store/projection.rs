//! Projections fold events into a materialized `PersistedState`

use serde_json::Value;

use crate::error::{PersistError, PersistResult};
use crate::types::{EventType, PersistedState, StateData, StateEvent, StateTransition};

/// Event metadata flag marking `Created`/`Updated` data as a whole state that replaces the prior one
pub const REPLACE_STATE: &str = "replace_state";

/// A pure `(prior_state, event) -> new_state` function
///
/// Projections must not perform I/O or depend on anything but their
/// arguments; replaying the same events always yields the same state.
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, event_type: EventType) -> bool;

    fn apply(&self, state: PersistedState, event: &StateEvent) -> PersistResult<PersistedState>;
}

/// The built-in projection covering every event type
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProjection;

impl DefaultProjection {
    fn object_data(event: &StateEvent) -> PersistResult<StateData> {
        match &event.event_data {
            Value::Object(map) => Ok(map.clone()),
            Value::Null => Ok(StateData::new()),
            other => Err(PersistError::ValidationFailure(format!(
                "{} event {} carries non-object data: {}",
                event.event_type, event.sequence_number, other
            ))),
        }
    }

    fn replaces(event: &StateEvent) -> bool {
        matches!(event.metadata.get(REPLACE_STATE), Some(Value::Bool(true)))
    }
}

impl Projection for DefaultProjection {
    fn name(&self) -> &str {
        "default"
    }

    fn can_handle(&self, _event_type: EventType) -> bool {
        true
    }

    fn apply(&self, state: PersistedState, event: &StateEvent) -> PersistResult<PersistedState> {
        let mut next = match event.event_type {
            EventType::Created | EventType::Updated if Self::replaces(event) => {
                let mut replaced: PersistedState = event.parse_data()?;
                replaced.state_machine_id = event.state_machine_id.clone();
                replaced
            }

            EventType::Created => {
                let data = Self::object_data(event)?;
                let mut created = PersistedState::from_raw(&event.state_machine_id, &data);
                created.created_at = event.timestamp;
                created.updated_at = event.timestamp;
                created
            }

            EventType::Transitioned => {
                let transition: StateTransition = event.parse_data()?;
                let mut next = state;
                next.apply_transition(&transition)?;
                next
            }

            EventType::Updated => {
                let data = Self::object_data(event)?;
                let mut next = state;
                next.merge_fields(&data, event.timestamp);
                next
            }

            EventType::Restored => match serde_json::from_value::<PersistedState>(event.event_data.clone()) {
                Ok(mut restored) => {
                    restored.state_machine_id = event.state_machine_id.clone();
                    restored
                }
                Err(_) => {
                    let data = Self::object_data(event)?;
                    let mut next = state;
                    next.merge_fields(&data, event.timestamp);
                    next
                }
            },

            EventType::SnapshotCreated => {
                let mut next = state;
                if let Some(snapshot_id) = event.event_data.get("snapshot_id") {
                    next.metadata
                        .insert("last_snapshot_id".to_string(), snapshot_id.clone());
                }
                next
            }

            EventType::Deleted => {
                let mut next = state;
                next.metadata.insert("deleted".to_string(), Value::Bool(true));
                next.updated_at = event.timestamp;
                next
            }

            EventType::Error => {
                let mut next = state;
                let error = event
                    .event_data
                    .get("error")
                    .cloned()
                    .unwrap_or_else(|| event.event_data.clone());
                next.metadata.insert("last_error".to_string(), error);
                next
            }
        };

        next.set_sequence_number(event.sequence_number);
        Ok(next)
    }
}

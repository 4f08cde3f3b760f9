//! Data types shared by every component of the engine
//!
//! All of these are plain values: cheap to clone, serializable, and never
//! mutated once they have been handed to a store.

mod event;
mod snapshot;
mod state;
mod transition;
pub mod version;

pub use event::{EventStream, EventType, StateEvent};
pub use snapshot::SnapshotMetadata;
pub use state::{PersistedState, RecoveryPoint, DEFAULT_STATE_TYPE, RESERVED_KEYS};
pub use transition::{StateTransition, TransitionType};
pub use version::StateVersion;

/// Free-form JSON object used for state data, payloads and metadata
pub type StateData = serde_json::Map<String, serde_json::Value>;

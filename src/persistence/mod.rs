//! Persistence orchestration
//!
//! ```text
//! save_state / handle_transition
//!        │
//!        ▼
//!  ┌─────────────┐   deferred   ┌──────────────┐
//!  │ StateCache  │ ───────────► │ pending set  │ ◄── batch worker
//!  └─────────────┘              └──────────────┘
//!        │ forced / due
//!        ▼
//!  PersistenceStrategy: SnapshotOnly | EventSourced | Hybrid | Versioned
//! ```

mod cache;
mod manager;
mod metrics;
mod policy;
mod strategy;

pub use cache::StateCache;
pub use manager::{PersistenceManager, PersistenceManagerBuilder};
pub use metrics::{format_size, MetricsSnapshot, PersistenceMetrics};
pub use policy::{AutoPersistencePolicy, PersistAction};
pub use strategy::{
    EventSourcedStrategy, HybridStrategy, PersistenceStrategy, SnapshotOnlyStrategy, VersionedStrategy,
};

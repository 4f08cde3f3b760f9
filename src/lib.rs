//! Game State Persistence Engine
//!
//! Durable state for game-session state machines: an append-only event
//! store, checksummed snapshots, a transition audit log, multi-strategy
//! recovery and schema migration, behind one persistence façade.
//!
//! # Features
//!
//! - **Event Sourcing**: gap-free sequence numbers, projections, replay
//! - **Snapshots**: gzip + SHA-256 verified, retention per state machine
//! - **Transition Log**: queryable audit trail with rotation and anomaly detection
//! - **Recovery**: snapshot, event-sourced and hybrid strategies with validation
//! - **Versioning**: BFS migration paths and concurrent-save conflict resolution
//!
//! # Modules
//!
//! - `types`: Core data structures (StateEvent, PersistedState, StateVersion)
//! - `event_store`: Event streams, projections and handlers
//! - `snapshot`: Snapshot codec, stores and manager
//! - `transition_log`: Transition stores, logger and pattern analyzer
//! - `recovery`: Recovery strategies and manager
//! - `versioning`: Migrations, migration runner and version manager
//! - `persistence`: Strategy selection, caching and background workers
//! - `storage`: Pluggable key/value backends
//! - `utils`: Clocks, atomic writes, JSON helpers
//!
//! # Example
//!
//! ```no_run
//! use game_state_persist::{PersistenceConfig, PersistenceManager, PersistedState};
//!
//! # async fn run() -> game_state_persist::PersistResult<()> {
//! let manager = PersistenceManager::open(PersistenceConfig::from_env()?).await?;
//! manager.start();
//!
//! let raw = serde_json::json!({"current_state": "playing", "round": 1});
//! let state = PersistedState::from_raw("game-42", raw.as_object().unwrap());
//! manager.save_state("game-42", state, true).await?;
//!
//! let loaded = manager.load_state("game-42", None).await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event_store;
pub mod persistence;
pub mod recovery;
pub mod snapshot;
pub mod storage;
pub mod transition_log;
pub mod types;
pub mod utils;
pub mod versioning;

// Re-export commonly used items at crate root
pub use config::{
    EventStoreConfig, PatternAnalyzerConfig, PersistenceConfig, RecoveryConfig, SnapshotConfig, StrategyKind,
    TransitionLogConfig,
};
pub use error::{PersistError, PersistResult};
pub use event_store::EventStore;
pub use persistence::{AutoPersistencePolicy, PersistenceManager, PersistenceManagerBuilder, PersistenceMetrics};
pub use recovery::{RecoveryManager, RecoveryMode, RecoveryOptions, RecoveryResult, RecoveryStatus};
pub use snapshot::SnapshotManager;
pub use transition_log::TransitionLogger;
pub use types::{
    EventStream, EventType, PersistedState, RecoveryPoint, SnapshotMetadata, StateData, StateEvent,
    StateTransition, StateVersion, TransitionType,
};
pub use versioning::{MigrationRunner, StateVersionManager, VersionConflictResolver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

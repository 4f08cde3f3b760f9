//! Transition audit log
//!
//! A queryable history of every transition, separate from the event store,
//! fanned out across one or more `TransitionStore`s and watched by a
//! `PatternAnalyzer`.

mod analyzer;
mod file_store;
mod logger;
mod query;
mod store;

pub use analyzer::{Anomaly, AnomalyKind, PatternAnalyzer};
pub use file_store::{ArchiveInfo, FileTransitionStore};
pub use logger::TransitionLogger;
pub use query::{TransitionQuery, TransitionRecord};
pub use store::{InMemoryTransitionStore, TransitionStore};

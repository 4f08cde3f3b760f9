//! Snapshots: checksummed, optionally compressed point-in-time state
//!
//! - `codec`: canonical JSON, SHA-256 checksum, gzip envelope
//! - `SnapshotStore`: where bodies and sidecar metadata live
//! - `SnapshotManager`: fan-out, restore, retention and snapshot policy

pub mod codec;
mod file_store;
mod manager;
mod store;

pub use file_store::FileSnapshotStore;
pub use manager::SnapshotManager;
pub use store::{InMemorySnapshotStore, SnapshotStore};

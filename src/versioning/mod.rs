//! Schema versioning, migration chains and save-conflict resolution

pub mod bundled;
mod conflict;
mod manager;
mod migration;
mod runner;

pub use conflict::{ConflictResolver, VersionConflictResolver, VersionedState};
pub use manager::StateVersionManager;
pub use migration::{CompositeMigration, FnMigration, Migration};
pub use runner::MigrationRunner;

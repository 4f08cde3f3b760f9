//! Multi-strategy state recovery
//!
//! ```text
//! recover(id, options)
//!     │
//!     ▼
//! first strategy with can_recover(mode) ── none ──► default ── none ──► RecoveryNotPossible
//!     │
//!     ▼
//! attempt (timeout, retries) ──► validate ──► Success | Partial | Failed
//! ```

mod manager;
mod strategy;
mod types;
mod validator;

pub use manager::RecoveryManager;
pub use strategy::{EventSourcedRecovery, HybridRecovery, RecoveryStrategy, SnapshotRecovery};
pub use types::{RecoveryAttempt, RecoveryMode, RecoveryOptions, RecoveryResult, RecoveryStatus};
pub use validator::{FnValidator, StateValidator, StructuralValidator};

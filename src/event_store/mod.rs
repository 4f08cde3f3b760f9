//! Event Store Module for Event Sourcing
//!
//! This module provides the append-only event log of every state machine:
//! - `EventStore`: sequencing, durable append, replay and compaction
//! - `Projection`: pure folds from events to `PersistedState`
//! - `EventHandler`: post-append notifications
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//! ┌──────────┐    ┌──────────────┐    ┌──────────────────┐    ┌──────────┐
//! │ append() │───►│ next sequence│───►│ backend.set(     │───►│ handlers │
//! │          │    │ (stream lock)│    │ events/<id>/<seq>│    │ (async)  │
//! └──────────┘    └──────────────┘    └──────────────────┘    └──────────┘
//!
//! Read Path:
//! ┌───────────────┐    ┌──────────────────┐
//! │ snapshot or   │───►│ fold events      │───► PersistedState
//! │ empty state   │    │ via projections  │
//! └───────────────┘    └──────────────────┘
//! ```

mod handler;
mod projection;
mod store;

pub use handler::{EventHandler, FnEventHandler};
pub use projection::{DefaultProjection, Projection, REPLACE_STATE};
pub use store::EventStore;

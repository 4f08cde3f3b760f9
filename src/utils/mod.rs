//! Utility functions and helpers
//!
//! Clocks, atomic file writes and JSON helpers used across the engine.

pub mod atomic;
pub mod json;
pub mod time;

pub use atomic::{atomic_write, atomic_write_lines, cleanup_temp_files, remove_if_exists};
pub use json::{canonical_json_bytes, deep_merge};
pub use time::{system_clock, to_chrono, Clock, FakeClock, SystemClock};

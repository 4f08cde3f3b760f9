//! Persistence metrics
//!
//! Counters and moving-average latencies, kept globally and per state
//! machine.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Weight of the newest sample in the moving averages
const LATENCY_ALPHA: f64 = 0.2;

/// Counters for one scope (global or one state machine)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub saves: u64,
    pub loads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures: u64,
    /// Exponential moving average in milliseconds
    pub avg_save_ms: f64,
    pub avg_load_ms: f64,
    /// Serialized size of every persisted state
    pub bytes_saved: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    fn record_save(&mut self, elapsed: Duration, bytes: u64) {
        self.avg_save_ms = moving_average(self.avg_save_ms, self.saves, elapsed);
        self.saves += 1;
        self.bytes_saved += bytes;
    }

    fn record_load(&mut self, elapsed: Duration) {
        self.avg_load_ms = moving_average(self.avg_load_ms, self.loads, elapsed);
        self.loads += 1;
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "saves={} ({:.2} ms avg, {}) loads={} ({:.2} ms avg) cache hit ratio={:.2} failures={}",
            self.saves,
            self.avg_save_ms,
            format_size(self.bytes_saved),
            self.loads,
            self.avg_load_ms,
            self.cache_hit_ratio(),
            self.failures
        )
    }
}

fn moving_average(current: f64, samples: u64, elapsed: Duration) -> f64 {
    let sample = elapsed.as_secs_f64() * 1000.0;
    if samples == 0 {
        sample
    } else {
        LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * current
    }
}

/// Format size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[derive(Default)]
struct MetricsInner {
    global: MetricsSnapshot,
    per_id: HashMap<String, MetricsSnapshot>,
}

impl MetricsInner {
    fn update(&mut self, state_machine_id: &str, f: impl Fn(&mut MetricsSnapshot)) {
        f(&mut self.global);
        f(self.per_id.entry(state_machine_id.to_string()).or_default());
    }
}

/// Thread-safe collector shared by the persistence manager and its workers
#[derive(Default)]
pub struct PersistenceMetrics {
    inner: Mutex<MetricsInner>,
}

impl PersistenceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_save(&self, state_machine_id: &str, elapsed: Duration, bytes: u64) {
        self.inner
            .lock()
            .update(state_machine_id, |m| m.record_save(elapsed, bytes));
    }

    pub fn record_load(&self, state_machine_id: &str, elapsed: Duration) {
        self.inner
            .lock()
            .update(state_machine_id, |m| m.record_load(elapsed));
    }

    pub fn record_cache_hit(&self, state_machine_id: &str) {
        self.inner.lock().update(state_machine_id, |m| m.cache_hits += 1);
    }

    pub fn record_cache_miss(&self, state_machine_id: &str) {
        self.inner.lock().update(state_machine_id, |m| m.cache_misses += 1);
    }

    pub fn record_failure(&self, state_machine_id: &str) {
        self.inner.lock().update(state_machine_id, |m| m.failures += 1);
    }

    /// Global counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().global.clone()
    }

    pub fn for_state_machine(&self, state_machine_id: &str) -> Option<MetricsSnapshot> {
        self.inner.lock().per_id.get(state_machine_id).cloned()
    }

    /// Drop the per-id counters of a state machine
    pub fn forget(&self, state_machine_id: &str) {
        self.inner.lock().per_id.remove(state_machine_id);
    }
}

//! Rolling-window pattern analysis over logged transitions
//!
//! Anomalies are advisory: they are recorded and logged, never used to
//! reject a transition.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::PatternAnalyzerConfig;
use crate::types::StateTransition;

/// What made a window look suspicious
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyKind {
    /// One `from:action:to` pattern repeated `count` times inside the window
    RepeatedPattern { pattern: String, count: usize },
    /// `count` error-flagged transitions inside the window
    ErrorBurst { count: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub state_machine_id: String,
    pub kind: AnomalyKind,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Window {
    recent: VecDeque<StateTransition>,
    anomalies: VecDeque<Anomaly>,
}

/// Keeps the last `window_size` transitions of each state machine
pub struct PatternAnalyzer {
    config: PatternAnalyzerConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl PatternAnalyzer {
    pub fn new(config: PatternAnalyzerConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PatternAnalyzerConfig {
        &self.config
    }

    /// Add a transition to the window and return any anomalies it triggers
    ///
    /// Each anomaly fires once, when its count reaches the threshold.
    pub fn observe(
        &self,
        state_machine_id: &str,
        transition: &StateTransition,
        now: DateTime<Utc>,
    ) -> Vec<Anomaly> {
        let mut windows = self.windows.lock();
        let window = windows.entry(state_machine_id.to_string()).or_default();

        window.recent.push_back(transition.clone());
        while window.recent.len() > self.config.window_size {
            window.recent.pop_front();
        }

        let mut detected = Vec::new();

        let pattern = transition.pattern_key();
        let repeats = window
            .recent
            .iter()
            .filter(|t| t.pattern_key() == pattern)
            .count();
        if self.config.repeat_threshold > 0 && repeats == self.config.repeat_threshold {
            detected.push(AnomalyKind::RepeatedPattern {
                pattern,
                count: repeats,
            });
        }

        if transition.is_error() {
            let errors = window.recent.iter().filter(|t| t.is_error()).count();
            if self.config.error_threshold > 0 && errors == self.config.error_threshold {
                detected.push(AnomalyKind::ErrorBurst { count: errors });
            }
        }

        let anomalies: Vec<Anomaly> = detected
            .into_iter()
            .map(|kind| Anomaly {
                state_machine_id: state_machine_id.to_string(),
                kind,
                detected_at: now,
            })
            .collect();

        for anomaly in &anomalies {
            window.anomalies.push_back(anomaly.clone());
            while window.anomalies.len() > self.config.max_anomalies {
                window.anomalies.pop_front();
            }
        }

        anomalies
    }

    /// Recorded anomalies of a state machine, oldest first
    pub fn anomalies(&self, state_machine_id: &str) -> Vec<Anomaly> {
        self.windows
            .lock()
            .get(state_machine_id)
            .map(|w| w.anomalies.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// How often each pattern occurs in the current window
    pub fn pattern_counts(&self, state_machine_id: &str) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        if let Some(window) = self.windows.lock().get(state_machine_id) {
            for transition in &window.recent {
                *counts.entry(transition.pattern_key()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Forget window entries and anomalies older than `before`
    ///
    /// A window left empty is dropped entirely.
    pub fn prune(&self, state_machine_id: &str, before: DateTime<Utc>) {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(state_machine_id) else {
            return;
        };
        window.recent.retain(|t| t.timestamp >= before);
        window.anomalies.retain(|a| a.detected_at >= before);
        if window.recent.is_empty() && window.anomalies.is_empty() {
            windows.remove(state_machine_id);
        }
    }

    /// Number of state machines with a live window
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn reset(&self, state_machine_id: &str) {
        self.windows.lock().remove(state_machine_id);
    }
}

impl Default for PatternAnalyzer {
    fn default() -> Self {
        Self::new(PatternAnalyzerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn analyzer(window_size: usize, repeat_threshold: usize, error_threshold: usize) -> PatternAnalyzer {
        PatternAnalyzer::new(PatternAnalyzerConfig {
            window_size,
            repeat_threshold,
            error_threshold,
            max_anomalies: 10,
        })
    }

    #[test]
    fn test_repeated_pattern_fires_once_at_threshold() {
        let analyzer = analyzer(10, 3, 5);
        let spin = StateTransition::new("playing", "playing", "spin");
        let now = Utc::now();

        assert!(analyzer.observe("g1", &spin, now).is_empty());
        assert!(analyzer.observe("g1", &spin, now).is_empty());
        let fired = analyzer.observe("g1", &spin, now);
        assert_eq!(
            fired[0].kind,
            AnomalyKind::RepeatedPattern {
                pattern: "playing:spin:playing".to_string(),
                count: 3
            }
        );
        assert!(analyzer.observe("g1", &spin, now).is_empty());
        assert_eq!(analyzer.anomalies("g1").len(), 1);
        assert!(analyzer.anomalies("g2").is_empty());
    }

    #[test]
    fn test_window_slides() {
        let analyzer = analyzer(2, 3, 5);
        let now = Utc::now();
        let spin = StateTransition::new("a", "a", "spin");
        let other = StateTransition::new("a", "b", "go");

        analyzer.observe("g1", &spin, now);
        analyzer.observe("g1", &spin, now);
        analyzer.observe("g1", &other, now);
        assert!(analyzer.observe("g1", &spin, now).is_empty());
        assert_eq!(analyzer.pattern_counts("g1").get("a:spin:a"), Some(&1));
    }

    #[test]
    fn test_error_burst() {
        let analyzer = analyzer(10, 100, 2);
        let now = Utc::now();
        let failed = StateTransition::new("playing", "error", "desync").with_metadata("error", json!("checksum"));

        assert!(analyzer.observe("g1", &failed, now).is_empty());
        let fired = analyzer.observe("g1", &failed, now);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, AnomalyKind::ErrorBurst { count: 2 });

        analyzer.reset("g1");
        assert!(analyzer.anomalies("g1").is_empty());
    }

    #[test]
    fn test_prune_drops_old_entries() {
        let analyzer = analyzer(10, 2, 5);
        let start = Utc::now() - chrono::Duration::hours(1);
        let spin = StateTransition::new("a", "a", "spin");

        analyzer.observe("g1", &spin.clone().at(start), start);
        let fired = analyzer.observe("g1", &spin.clone().at(start), start);
        assert_eq!(fired.len(), 1);
        let later = start + chrono::Duration::minutes(30);
        analyzer.observe("g2", &spin.clone().at(later), later);
        assert_eq!(analyzer.tracked(), 2);

        analyzer.prune("g1", start + chrono::Duration::minutes(1));
        analyzer.prune("g2", start + chrono::Duration::minutes(1));
        assert_eq!(analyzer.tracked(), 1);
        assert!(analyzer.anomalies("g1").is_empty());
        assert_eq!(analyzer.pattern_counts("g2").get("a:spin:a"), Some(&1));

        analyzer.prune("missing", Utc::now());
        assert_eq!(analyzer.tracked(), 1);
    }
}

//! When state changes trigger persistence

use std::time::Duration;

use crate::types::StateTransition;

/// What a state change should do to persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistAction {
    /// Nothing beyond the cache update
    None,
    /// Queue the id for the batch worker
    Defer,
    /// Save right away
    Immediate,
}

/// Triggers for automatic persistence
#[derive(Debug, Clone)]
pub struct AutoPersistencePolicy {
    pub on_transition: bool,
    pub on_update: bool,
    pub on_error: bool,
    /// Phase changes are saved immediately instead of deferred
    pub on_phase_change: bool,
    /// Deferred saves wait at least this long before the batch worker picks them up
    pub interval: Option<Duration>,
}

impl Default for AutoPersistencePolicy {
    fn default() -> Self {
        Self {
            on_transition: true,
            on_update: false,
            on_error: true,
            on_phase_change: true,
            interval: None,
        }
    }
}

impl AutoPersistencePolicy {
    /// A policy that never persists on its own
    pub fn manual() -> Self {
        Self {
            on_transition: false,
            on_update: false,
            on_error: false,
            on_phase_change: false,
            interval: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn for_transition(&self, transition: &StateTransition) -> PersistAction {
        if self.on_phase_change && transition.is_phase_change() {
            PersistAction::Immediate
        } else if (self.on_error && transition.is_error()) || self.on_transition {
            PersistAction::Defer
        } else {
            PersistAction::None
        }
    }

    pub fn for_update(&self) -> PersistAction {
        if self.on_update {
            PersistAction::Defer
        } else {
            PersistAction::None
        }
    }
}

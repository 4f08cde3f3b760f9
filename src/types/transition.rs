//! State transitions
//!
//! A `StateTransition` describes one atomic change of a state machine.
//! Transitions are never mutated once created; the builder methods consume
//! and return `self` so they can only be used while constructing one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StateData;

/// An immutable description of one state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: String,
    pub to_state: String,
    pub action: String,
    #[serde(default)]
    pub payload: StateData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: StateData,
}

impl StateTransition {
    pub fn new(from_state: impl Into<String>, to_state: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            from_state: from_state.into(),
            to_state: to_state.into(),
            action: action.into(),
            payload: StateData::new(),
            actor_id: None,
            timestamp: Utc::now(),
            metadata: StateData::new(),
        }
    }

    pub fn with_payload(mut self, payload: StateData) -> Self {
        self.payload = payload;
        self
    }

    /// Set a single payload field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this transition was flagged as an error
    ///
    /// A transition is an error when its metadata carries a non-null,
    /// non-false `error` entry.
    pub fn is_error(&self) -> bool {
        match self.metadata.get("error") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(_) => true,
        }
    }

    /// Whether the machine moves to a different state (a phase change)
    pub fn is_phase_change(&self) -> bool {
        if let Some(Value::Bool(flag)) = self.metadata.get("phase_change") {
            return *flag;
        }
        self.from_state != self.to_state
    }

    /// The `from:action:to` key used by pattern analysis
    pub fn pattern_key(&self) -> String {
        format!("{}:{}:{}", self.from_state, self.action, self.to_state)
    }
}

/// Classification of a logged transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    /// Triggered by a player action
    UserAction,
    /// Triggered by the server itself (ticks, scheduled work)
    SystemEvent,
    /// Triggered by an expired timer
    Timeout,
    /// Recovering from, or reporting, an error
    ErrorRecovery,
    /// Forced by an operator
    AdminOverride,
}

impl TransitionType {
    /// Infer the type of a transition from its metadata and actor
    ///
    /// An explicit `transition_type` metadata entry always wins. Otherwise:
    /// error flag, then timeout markers, then `admin` actors, then
    /// `system` (or missing) actors, and finally a user action.
    pub fn classify(transition: &StateTransition) -> Self {
        if let Some(explicit) = transition
            .metadata
            .get("transition_type")
            .and_then(Value::as_str)
            .and_then(Self::parse)
        {
            return explicit;
        }

        if transition.is_error() {
            return TransitionType::ErrorRecovery;
        }

        let timed_out = matches!(transition.metadata.get("timeout"), Some(Value::Bool(true)));
        if timed_out || transition.action.to_ascii_lowercase().contains("timeout") {
            return TransitionType::Timeout;
        }

        let admin_flag = matches!(transition.metadata.get("admin"), Some(Value::Bool(true)));
        match transition.actor_id.as_deref() {
            _ if admin_flag => TransitionType::AdminOverride,
            Some(actor) if actor.starts_with("admin") => TransitionType::AdminOverride,
            None => TransitionType::SystemEvent,
            Some(actor) if actor.starts_with("system") => TransitionType::SystemEvent,
            Some(_) => TransitionType::UserAction,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user_action" => Some(TransitionType::UserAction),
            "system_event" => Some(TransitionType::SystemEvent),
            "timeout" => Some(TransitionType::Timeout),
            "error_recovery" => Some(TransitionType::ErrorRecovery),
            "admin_override" => Some(TransitionType::AdminOverride),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionType::UserAction => write!(f, "user_action"),
            TransitionType::SystemEvent => write!(f, "system_event"),
            TransitionType::Timeout => write!(f, "timeout"),
            TransitionType::ErrorRecovery => write!(f, "error_recovery"),
            TransitionType::AdminOverride => write!(f, "admin_override"),
        }
    }
}

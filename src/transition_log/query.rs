//! Logged transition records and the query filter over them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{StateTransition, TransitionType};

/// One entry of the transition audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub state_machine_id: String,
    /// Position in this state machine's log, starting at 1
    pub sequence: u64,
    pub transition_type: TransitionType,
    pub transition: StateTransition,
    pub logged_at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Filter, order and paginate transition records
///
/// Time bounds apply to the transition's own timestamp: `after` is
/// exclusive and `until` inclusive.
#[derive(Debug, Clone, Default)]
pub struct TransitionQuery {
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub action: Option<String>,
    pub actor_id: Option<String>,
    pub transition_type: Option<TransitionType>,
    pub after: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub descending: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TransitionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(mut self, state: impl Into<String>) -> Self {
        self.from_state = Some(state.into());
        self
    }

    pub fn to_state(mut self, state: impl Into<String>) -> Self {
        self.to_state = Some(state.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn of_type(mut self, transition_type: TransitionType) -> Self {
        self.transition_type = Some(transition_type);
        self
    }

    pub fn between(mut self, after: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.after = after;
        self.until = until;
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, record: &TransitionRecord) -> bool {
        let t = &record.transition;
        self.from_state.as_ref().map_or(true, |s| &t.from_state == s)
            && self.to_state.as_ref().map_or(true, |s| &t.to_state == s)
            && self.action.as_ref().map_or(true, |a| &t.action == a)
            && self
                .actor_id
                .as_ref()
                .map_or(true, |a| t.actor_id.as_ref() == Some(a))
            && self
                .transition_type
                .map_or(true, |kind| record.transition_type == kind)
            && self.after.map_or(true, |after| t.timestamp > after)
            && self.until.map_or(true, |until| t.timestamp <= until)
    }

    /// Filter, order by sequence and paginate
    pub fn apply(&self, records: Vec<TransitionRecord>) -> Vec<TransitionRecord> {
        let mut matched: Vec<TransitionRecord> = records.into_iter().filter(|r| self.matches(r)).collect();
        matched.sort_by_key(|r| r.sequence);
        if self.descending {
            matched.reverse();
        }
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

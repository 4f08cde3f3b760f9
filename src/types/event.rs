//! Event types for the per-state-machine event log
//!
//! Events are immutable records of state changes. The current state of a
//! state machine is derived by folding its events through projections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StateData;
use crate::error::{PersistError, PersistResult};

/// Event types that can occur in a state machine's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The state machine was created with its initial state
    Created,
    /// A state transition was applied
    Transitioned,
    /// Arbitrary fields were updated without a transition
    Updated,
    /// A snapshot of the state was taken
    SnapshotCreated,
    /// State was overlaid from a recovered snapshot
    Restored,
    /// The state machine was deleted
    Deleted,
    /// An error was recorded against the state machine
    Error,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Created => write!(f, "created"),
            EventType::Transitioned => write!(f, "transitioned"),
            EventType::Updated => write!(f, "updated"),
            EventType::SnapshotCreated => write!(f, "snapshot_created"),
            EventType::Restored => write!(f, "restored"),
            EventType::Deleted => write!(f, "deleted"),
            EventType::Error => write!(f, "error"),
        }
    }
}

/// An immutable event in a state machine's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub event_id: String,
    pub state_machine_id: String,
    pub event_type: EventType,
    pub event_data: serde_json::Value,
    /// Assigned by the store; strictly increasing without gaps
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: StateData,
}

impl StateEvent {
    pub fn new(
        state_machine_id: impl Into<String>,
        event_type: EventType,
        event_data: serde_json::Value,
        sequence_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            state_machine_id: state_machine_id.into(),
            event_type,
            event_data,
            sequence_number,
            timestamp,
            actor_id: None,
            correlation_id: None,
            metadata: StateData::new(),
        }
    }

    pub fn with_actor(mut self, actor_id: Option<String>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Parse the event data as a specific type
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.event_data.clone())
    }

    /// Serialize event to a JSON line
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize event from a JSON line
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Ordered events of one state machine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStream {
    pub state_machine_id: String,
    pub events: Vec<StateEvent>,
    /// Latest sequence number in the stream
    pub version: u64,
    /// Sequence number covered by the most recent snapshot
    pub last_snapshot_version: u64,
    /// Events up to this sequence were compacted and survive only in snapshots
    #[serde(default)]
    pub compacted_through: u64,
    /// The stream was deleted at this sequence and its history restarts after it
    #[serde(default)]
    pub reset_at: u64,
}

impl EventStream {
    pub fn new(state_machine_id: impl Into<String>) -> Self {
        Self {
            state_machine_id: state_machine_id.into(),
            ..Default::default()
        }
    }

    /// Next sequence number to assign
    pub fn next_sequence(&self) -> u64 {
        self.version + 1
    }

    /// Push an event, refusing anything that would break contiguity
    pub fn push(&mut self, event: StateEvent) -> PersistResult<()> {
        let expected = self.next_sequence();
        if event.sequence_number != expected {
            return Err(PersistError::SequenceGapDetected {
                state_machine_id: self.state_machine_id.clone(),
                expected,
                found: event.sequence_number,
            });
        }
        self.version = event.sequence_number;
        self.events.push(event);
        Ok(())
    }

    /// Rebuild a stream from stored events, verifying there are no gaps
    ///
    /// Compaction may have removed a leading run of events, so the first
    /// event does not have to be sequence 1.
    pub fn from_events(state_machine_id: &str, mut events: Vec<StateEvent>) -> PersistResult<Self> {
        events.sort_by_key(|e| e.sequence_number);
        let mut stream = Self::new(state_machine_id);
        if let Some(first) = events.first() {
            stream.version = first.sequence_number.saturating_sub(1);
        }
        for event in events {
            stream.push(event)?;
        }
        Ok(stream)
    }

    /// Sequence number the oldest retained event must carry
    pub fn expected_first(&self) -> u64 {
        self.compacted_through.max(self.reset_at) + 1
    }

    /// Sequence number of the oldest retained event
    pub fn first_sequence(&self) -> Option<u64> {
        self.events.first().map(|e| e.sequence_number)
    }

    /// Events with `from < sequence <= to`
    pub fn range(&self, from: u64, to: Option<u64>) -> impl Iterator<Item = &StateEvent> {
        let to = to.unwrap_or(u64::MAX);
        self.events
            .iter()
            .filter(move |e| e.sequence_number > from && e.sequence_number <= to)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: u64) -> StateEvent {
        StateEvent::new("g1", EventType::Updated, json!({"round": seq}), seq, Utc::now())
    }

    #[test]
    fn test_event_type_serialization() {
        let json = serde_json::to_string(&EventType::SnapshotCreated).unwrap();
        assert_eq!(json, "\"snapshot_created\"");

        let parsed: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, EventType::SnapshotCreated);
    }

    #[test]
    fn test_event_json_line() {
        let event = event(3).with_actor(Some("player-1".to_string()));
        let line = event.to_json_line().unwrap();
        assert!(line.contains("\"event_type\":\"updated\""));
        assert!(line.contains("\"sequence_number\":3"));
        assert!(!line.contains("correlation_id"));

        let parsed = StateEvent::from_json_line(&line).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_stream_rejects_gap() {
        let mut stream = EventStream::new("g1");
        stream.push(event(1)).unwrap();
        stream.push(event(2)).unwrap();

        let err = stream.push(event(4)).unwrap_err();
        assert!(matches!(
            err,
            PersistError::SequenceGapDetected { expected: 3, found: 4, .. }
        ));
        assert_eq!(stream.version, 2);
    }

    #[test]
    fn test_stream_from_compacted_events() {
        let stream = EventStream::from_events("g1", vec![event(6), event(5), event(7)]).unwrap();
        assert_eq!(stream.first_sequence(), Some(5));
        assert_eq!(stream.version, 7);

        let gap = EventStream::from_events("g1", vec![event(1), event(3)]);
        assert!(gap.is_err());
    }

    #[test]
    fn test_range_is_exclusive_inclusive() {
        let stream = EventStream::from_events("g1", (1..=5).map(event).collect()).unwrap();
        let seqs: Vec<u64> = stream.range(2, Some(4)).map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![3, 4]);
    }
}

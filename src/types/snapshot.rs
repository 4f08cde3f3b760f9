//! Snapshot metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{version, RecoveryPoint, StateVersion};

/// Sidecar metadata describing one stored snapshot
///
/// The version is written as its `major.minor.patch` string so the sidecar
/// file stays readable by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub state_machine_id: String,
    #[serde(with = "version::as_string")]
    pub version: StateVersion,
    pub created_at: DateTime<Utc>,
    /// Size of the stored body (after compression, if any)
    pub size_bytes: u64,
    pub compressed: bool,
    /// Hex SHA-256 of the canonical, uncompressed state
    pub checksum: String,
    pub transition_count: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Per-state-machine creation counter, orders snapshots sharing a timestamp
    #[serde(default)]
    pub ordinal: u64,
    /// Last event sequence folded into the snapshotted state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

impl SnapshotMetadata {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Describe this snapshot as a recovery point (without loading the body)
    pub fn to_recovery_point(&self) -> RecoveryPoint {
        let mut point = RecoveryPoint::new(&self.snapshot_id, &self.state_machine_id, self.created_at);
        point.transition_count = self.transition_count;
        point
            .metadata
            .insert("snapshot_id".to_string(), self.snapshot_id.clone().into());
        point
            .metadata
            .insert("version".to_string(), self.version.to_string().into());
        point
            .metadata
            .insert("checksum".to_string(), self.checksum.clone().into());
        point
            .metadata
            .insert("compressed".to_string(), self.compressed.into());
        if let Some(sequence) = self.sequence_number {
            point
                .metadata
                .insert("sequence_number".to_string(), sequence.into());
        }
        point
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

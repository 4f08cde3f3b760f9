//! Semantic state versions
//!
//! A `StateVersion` is used both as a schema version (what shape the state
//! data has) and as an opaque save-version (which write produced it).
//! Ordering, equality and hashing only look at `(major, minor, patch)`;
//! the timestamp is informational.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistError;

/// A `major.minor.patch` version with the time it was minted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl StateVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            timestamp: Utc::now(),
        }
    }

    /// The version every new state starts at (1.0.0)
    pub fn initial() -> Self {
        Self::new(1, 0, 0)
    }

    /// Event-sourced save-versions are plain sequence numbers, carried as `0.0.<seq>`
    ///
    /// `None` for sequences that do not fit the patch component.
    pub fn from_sequence(sequence: u64) -> Option<Self> {
        u32::try_from(sequence).ok().map(|patch| Self::new(0, 0, patch))
    }

    /// Inverse of [`StateVersion::from_sequence`]
    pub fn as_sequence(&self) -> Option<u64> {
        if self.major == 0 && self.minor == 0 {
            Some(self.patch as u64)
        } else {
            None
        }
    }

    pub fn bump_patch(&self) -> Self {
        Self::new(self.major, self.minor, self.patch.saturating_add(1))
    }

    pub fn bump_minor(&self) -> Self {
        Self::new(self.major, self.minor.saturating_add(1), 0)
    }

    pub fn bump_major(&self) -> Self {
        Self::new(self.major.saturating_add(1), 0, 0)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn key(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

impl Default for StateVersion {
    fn default() -> Self {
        Self::initial()
    }
}

impl PartialEq for StateVersion {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for StateVersion {}

impl Hash for StateVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for StateVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StateVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for StateVersion {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().trim_start_matches('v').split('.').collect();
        if parts.len() != 3 {
            return Err(PersistError::ValidationFailure(format!(
                "invalid version string: {}",
                s
            )));
        }

        let parse = |part: &str| {
            part.parse::<u32>().map_err(|_| {
                PersistError::ValidationFailure(format!("invalid version component in {}", s))
            })
        };

        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

/// Serde adapter writing a version as its `major.minor.patch` string
pub mod as_string {
    use super::StateVersion;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &StateVersion, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(version)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StateVersion, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_ignores_timestamp() {
        let a = StateVersion::new(1, 2, 3).with_timestamp(Utc::now());
        let b = StateVersion::new(1, 2, 3).with_timestamp(Utc::now() - chrono::Duration::hours(5));
        assert_eq!(a, b);
        assert!(StateVersion::new(1, 2, 3) < StateVersion::new(1, 3, 0));
        assert!(StateVersion::new(2, 0, 0) > StateVersion::new(1, 99, 99));
    }

    #[test]
    fn test_parse_and_display() {
        let v: StateVersion = "2.10.7".parse().unwrap();
        assert_eq!(v.to_string(), "2.10.7");
        assert!("2.10".parse::<StateVersion>().is_err());
        assert!("a.b.c".parse::<StateVersion>().is_err());
    }

    #[test]
    fn test_bumps() {
        let v = StateVersion::new(1, 4, 2);
        assert_eq!(v.bump_patch(), StateVersion::new(1, 4, 3));
        assert_eq!(v.bump_minor(), StateVersion::new(1, 5, 0));
        assert_eq!(v.bump_major(), StateVersion::new(2, 0, 0));
    }

    #[test]
    fn test_sequence_versions() {
        let v = StateVersion::from_sequence(42).unwrap();
        assert_eq!(v.as_sequence(), Some(42));
        assert_eq!(StateVersion::initial().as_sequence(), None);

        let last = StateVersion::from_sequence(u32::MAX as u64).unwrap();
        assert_eq!(last.as_sequence(), Some(u32::MAX as u64));
        assert!(StateVersion::from_sequence(u32::MAX as u64 + 1).is_none());
    }
}

//! Configuration for every engine component
//!
//! Each component takes its own config struct with sensible defaults.
//! `PersistenceConfig::from_env` overlays `GAME_STATE_*` environment
//! variables on top of the defaults.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PersistError, PersistResult};

/// Configuration for the EventStore
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Reject appends whose data is not a JSON object
    pub require_object_data: bool,
    /// Verify contiguity when a stream is loaded from the backend
    pub verify_on_load: bool,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            require_object_data: true,
            verify_on_load: true,
        }
    }
}

/// Configuration for the SnapshotManager
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Maximum snapshots kept per state machine (oldest evicted first)
    pub max_snapshots: usize,
    /// Snapshots older than this are evicted
    pub retention_period: Option<Duration>,
    /// Minimum time between policy-triggered snapshots
    pub snapshot_interval: Duration,
    /// Always snapshot on major transitions
    pub snapshot_on_major_transition: bool,
    /// Gzip snapshot bodies
    pub compress: bool,
    /// Bodies smaller than this are stored uncompressed
    pub compression_threshold: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 10,
            retention_period: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            snapshot_interval: Duration::from_secs(300),
            snapshot_on_major_transition: true,
            compress: true,
            compression_threshold: 1024,
        }
    }
}

/// Configuration for file-backed transition logs
#[derive(Debug, Clone)]
pub struct TransitionLogConfig {
    /// Root directory for transition log files
    pub log_dir: PathBuf,
    /// Rotate the active file once it reaches this size
    pub max_file_bytes: u64,
    /// Rotated files kept per state machine
    pub max_files: usize,
}

impl Default for TransitionLogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("data").join("transitions"),
            max_file_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

impl TransitionLogConfig {
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// Configuration for the transition pattern analyzer
#[derive(Debug, Clone)]
pub struct PatternAnalyzerConfig {
    /// Transitions remembered per state machine
    pub window_size: usize,
    /// Repeats of one pattern inside the window that count as an anomaly
    pub repeat_threshold: usize,
    /// Error-flagged transitions inside the window that count as an anomaly
    pub error_threshold: usize,
    /// Anomalies remembered per state machine
    pub max_anomalies: usize,
}

impl Default for PatternAnalyzerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            repeat_threshold: 5,
            error_threshold: 3,
            max_anomalies: 100,
        }
    }
}

/// Configuration for the RecoveryManager
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Attempts per recovery call before giving up
    pub max_attempts: u32,
    /// Time limit for a single attempt
    pub attempt_timeout: Option<Duration>,
    /// Validate recovered state unless the caller says otherwise
    pub validate_by_default: bool,
    /// Attempts kept in the in-process history
    pub history_limit: usize,
    /// Hybrid recovery returns snapshots younger than this as-is
    pub snapshot_age_threshold: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout: Some(Duration::from_secs(30)),
            validate_by_default: true,
            history_limit: 1000,
            snapshot_age_threshold: Duration::from_secs(60),
        }
    }
}

/// How the persistence manager stores state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    SnapshotOnly,
    EventSourced,
    Hybrid,
    Versioned,
}

impl StrategyKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "snapshot_only" | "snapshot" => Some(StrategyKind::SnapshotOnly),
            "event_sourced" | "events" => Some(StrategyKind::EventSourced),
            "hybrid" => Some(StrategyKind::Hybrid),
            "versioned" => Some(StrategyKind::Versioned),
            _ => None,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::SnapshotOnly => write!(f, "snapshot_only"),
            StrategyKind::EventSourced => write!(f, "event_sourced"),
            StrategyKind::Hybrid => write!(f, "hybrid"),
            StrategyKind::Versioned => write!(f, "versioned"),
        }
    }
}

/// Configuration for the PersistenceManager and its background workers
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub strategy: StrategyKind,
    /// Root directory for file-backed stores
    pub data_dir: PathBuf,
    /// Upper bound on cached states
    pub cache_size: usize,
    /// Cached states idle longer than this are expired
    pub cache_ttl: Option<Duration>,
    /// Minimum time between SnapshotOnly saves of one state machine
    pub snapshot_interval: Duration,
    /// How often the batch worker runs
    pub batch_interval: Duration,
    /// Maximum pending ids persisted per batch
    pub batch_size: usize,
    /// How often the archival worker sweeps
    pub archive_interval: Duration,
    /// Transitions older than this are compacted by the archival worker
    pub archive_after: Duration,
    /// Bound of the archive queue
    pub archive_queue_capacity: usize,
    /// How often expired cache entries are evicted
    pub cache_sweep_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Hybrid,
            data_dir: PathBuf::from("data"),
            cache_size: 1000,
            cache_ttl: Some(Duration::from_secs(3600)),
            snapshot_interval: Duration::from_secs(60),
            batch_interval: Duration::from_secs(5),
            batch_size: 50,
            archive_interval: Duration::from_secs(3600),
            archive_after: Duration::from_secs(30 * 24 * 60 * 60),
            archive_queue_capacity: 256,
            cache_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PersistenceConfig {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_data_dir<P: AsRef<Path>>(mut self, data_dir: P) -> Self {
        self.data_dir = data_dir.as_ref().to_path_buf();
        self
    }

    /// Defaults overlaid with `GAME_STATE_*` environment variables
    ///
    /// Recognised: `GAME_STATE_DATA_DIR`, `GAME_STATE_STRATEGY`,
    /// `GAME_STATE_CACHE_SIZE`, `GAME_STATE_SNAPSHOT_INTERVAL_SECS`,
    /// `GAME_STATE_BATCH_INTERVAL_SECS`, `GAME_STATE_BATCH_SIZE`,
    /// `GAME_STATE_ARCHIVE_INTERVAL_SECS`.
    pub fn from_env() -> PersistResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> PersistResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("GAME_STATE_DATA_DIR") {
            let path = PathBuf::from(&dir);
            config.data_dir = if path.is_absolute() {
                path
            } else {
                env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join(path)
            };
        }
        if let Some(raw) = lookup("GAME_STATE_STRATEGY") {
            config.strategy = StrategyKind::parse(&raw).ok_or_else(|| {
                PersistError::Configuration(format!("unknown persistence strategy: {}", raw))
            })?;
        }
        if let Some(size) = parse_var::<usize>(&lookup, "GAME_STATE_CACHE_SIZE")? {
            config.cache_size = size;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GAME_STATE_SNAPSHOT_INTERVAL_SECS")? {
            config.snapshot_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GAME_STATE_BATCH_INTERVAL_SECS")? {
            config.batch_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<usize>(&lookup, "GAME_STATE_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GAME_STATE_ARCHIVE_INTERVAL_SECS")? {
            config.archive_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Directory for file-backed snapshot stores
    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Directory for file-backed transition logs
    pub fn transitions_dir(&self) -> PathBuf {
        self.data_dir.join("transitions")
    }

    /// Directory for the generic file backend
    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join("documents")
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> PersistResult<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| PersistError::Configuration(format!("invalid value for {}: {}", key, raw))),
    }
}

//! File-backed transition log with size-based rotation
//!
//! Each state machine gets its own directory under the log root, named by
//! the hex encoding of its id:
//!
//! ```text
//! <log_dir>/<hex(id)>/
//!     transitions.jsonl                      active log
//!     transitions_20240101T120000123.jsonl   rotated archives (oldest first by name)
//! ```
//!
//! The active file is rotated once it reaches `max_file_bytes`; only the
//! `max_files` newest archives are kept.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use super::query::TransitionRecord;
use super::store::{compactable_prefix, TransitionStore};
use crate::config::TransitionLogConfig;
use crate::error::PersistResult;
use crate::utils::{atomic_write_lines, system_clock, Clock};

const ACTIVE_FILE: &str = "transitions.jsonl";
const ARCHIVE_PREFIX: &str = "transitions_";

/// Information about a rotated transition archive
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub size: u64,
}

/// Transition store writing JSONL files with rotation
pub struct FileTransitionStore {
    config: TransitionLogConfig,
    clock: Arc<dyn Clock>,
    write_lock: AsyncMutex<()>,
}

impl FileTransitionStore {
    pub async fn open(config: TransitionLogConfig) -> PersistResult<Self> {
        fs::create_dir_all(&config.log_dir).await?;
        Ok(Self {
            config,
            clock: system_clock(),
            write_lock: AsyncMutex::new(()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TransitionLogConfig {
        &self.config
    }

    fn state_dir(&self, state_machine_id: &str) -> PathBuf {
        self.config.log_dir.join(hex::encode(state_machine_id.as_bytes()))
    }

    fn active_path(&self, state_machine_id: &str) -> PathBuf {
        self.state_dir(state_machine_id).join(ACTIVE_FILE)
    }

    /// Rotated archives of one state machine, oldest first
    pub async fn list_archives(&self, state_machine_id: &str) -> PersistResult<Vec<ArchiveInfo>> {
        let dir = self.state_dir(state_machine_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut archives = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_archive = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(ARCHIVE_PREFIX) && n.ends_with(".jsonl"))
                .unwrap_or(false);
            if is_archive {
                let size = entry.metadata().await?.len();
                archives.push(ArchiveInfo { path, size });
            }
        }

        archives.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(archives)
    }

    /// Move the active file aside under a timestamped name
    ///
    /// Returns the archive path, or `None` when there was nothing to rotate.
    async fn rotate(&self, state_machine_id: &str) -> PersistResult<Option<PathBuf>> {
        let active = self.active_path(state_machine_id);
        match fs::metadata(&active).await {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let stamp = self.clock.now().format("%Y%m%dT%H%M%S%3f").to_string();
        let dir = self.state_dir(state_machine_id);
        let mut archive = dir.join(format!("{}{}.jsonl", ARCHIVE_PREFIX, stamp));
        let mut suffix = 1;
        while fs::try_exists(&archive).await? {
            archive = dir.join(format!("{}{}_{}.jsonl", ARCHIVE_PREFIX, stamp, suffix));
            suffix += 1;
        }

        fs::rename(&active, &archive).await?;
        let removed = self.cleanup_old_archives(state_machine_id).await?;

        tracing::info!(
            state_machine_id = %state_machine_id,
            archive = %archive.display(),
            removed_archives = removed,
            "Rotated transition log"
        );
        Ok(Some(archive))
    }

    /// Keep only the `max_files` newest archives
    async fn cleanup_old_archives(&self, state_machine_id: &str) -> PersistResult<usize> {
        let archives = self.list_archives(state_machine_id).await?;
        if archives.len() <= self.config.max_files {
            return Ok(0);
        }

        let excess = archives.len() - self.config.max_files;
        for archive in &archives[..excess] {
            fs::remove_file(&archive.path).await?;
            tracing::debug!(archive = %archive.path.display(), "Deleted old transition archive");
        }
        Ok(excess)
    }

    /// Rotate every active file that has reached the size limit
    pub async fn rotate_all(&self) -> PersistResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut rotated = 0;
        for id in self.list_ids().await? {
            let size = match fs::metadata(self.active_path(&id)).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if size >= self.config.max_file_bytes && self.rotate(&id).await?.is_some() {
                rotated += 1;
            }
        }
        Ok(rotated)
    }

    async fn read_records(path: &Path) -> PersistResult<Vec<TransitionRecord>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match TransitionRecord::from_json_line(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        line = line_num + 1,
                        error = %e,
                        "Failed to parse transition record"
                    );
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl TransitionStore for FileTransitionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn append(&self, record: &TransitionRecord) -> PersistResult<()> {
        let _guard = self.write_lock.lock().await;
        let active = self.active_path(&record.state_machine_id);
        if let Some(parent) = active.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active)
            .await?;
        let mut line = record.to_json_line()?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        let size = file.metadata().await?.len();
        drop(file);

        if size >= self.config.max_file_bytes {
            self.rotate(&record.state_machine_id).await?;
        }
        Ok(())
    }

    async fn load(&self, state_machine_id: &str) -> PersistResult<Vec<TransitionRecord>> {
        let mut records = Vec::new();
        for archive in self.list_archives(state_machine_id).await? {
            records.extend(Self::read_records(&archive.path).await?);
        }
        records.extend(Self::read_records(&self.active_path(state_machine_id)).await?);
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Rewrites the surviving records into a fresh active file
    async fn compact(&self, state_machine_id: &str, before: DateTime<Utc>) -> PersistResult<usize> {
        let _guard = self.write_lock.lock().await;
        let records = self.load(state_machine_id).await?;
        let removable = compactable_prefix(&records, before);
        if removable == 0 {
            return Ok(0);
        }

        let mut lines = Vec::with_capacity(records.len() - removable);
        for record in &records[removable..] {
            lines.push(record.to_json_line()?);
        }
        atomic_write_lines(self.active_path(state_machine_id), &lines).await?;
        for archive in self.list_archives(state_machine_id).await? {
            fs::remove_file(&archive.path).await?;
        }

        tracing::info!(state_machine_id = %state_machine_id, removed = removable, "Compacted transition log");
        Ok(removable)
    }

    async fn delete_all(&self, state_machine_id: &str) -> PersistResult<usize> {
        let _guard = self.write_lock.lock().await;
        let count = self.load(state_machine_id).await?.len();
        match fs::remove_dir_all(self.state_dir(state_machine_id)).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ids(&self) -> PersistResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.config.log_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let decoded = entry
                .file_name()
                .to_str()
                .and_then(|name| hex::decode(name).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if let Some(id) = decoded {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

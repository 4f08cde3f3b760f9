//! Filesystem snapshot store
//!
//! Layout per state machine:
//!
//! ```text
//! root/<h0h1>/<h2h3>/<sanitized id>/
//!     <snapshot_id>.json         body (or .json.gz when compressed)
//!     <snapshot_id>.meta.json    sidecar SnapshotMetadata
//! ```
//!
//! `h` is the hex SHA-256 of the state machine id. Bodies and sidecars are
//! written atomically; the sidecar is written last so a listed snapshot
//! always has a body.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;

use super::store::{sort_oldest_first, SnapshotStore};
use crate::error::PersistResult;
use crate::types::SnapshotMetadata;
use crate::utils::{atomic_write, cleanup_temp_files, remove_if_exists};

const META_SUFFIX: &str = ".meta.json";

/// Snapshot store writing one document per snapshot under a hashed tree
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> PersistResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every snapshot of one state machine
    pub fn state_dir(&self, state_machine_id: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(state_machine_id.as_bytes()));
        self.root
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(sanitize(state_machine_id))
    }

    fn body_path(&self, metadata: &SnapshotMetadata) -> PathBuf {
        let ext = if metadata.compressed { "json.gz" } else { "json" };
        self.state_dir(&metadata.state_machine_id)
            .join(format!("{}.{}", metadata.snapshot_id, ext))
    }

    fn meta_path(&self, state_machine_id: &str, snapshot_id: &str) -> PathBuf {
        self.state_dir(state_machine_id)
            .join(format!("{}{}", snapshot_id, META_SUFFIX))
    }

    async fn read_metadata(path: &Path) -> PersistResult<Option<SnapshotMetadata>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(SnapshotMetadata::from_json_line(content.trim())?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keep ids filesystem-safe; the hashed parent directories disambiguate
fn sanitize(state_machine_id: &str) -> String {
    state_machine_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn save(&self, metadata: &SnapshotMetadata, body: &[u8]) -> PersistResult<String> {
        atomic_write(self.body_path(metadata), body).await?;
        atomic_write(
            self.meta_path(&metadata.state_machine_id, &metadata.snapshot_id),
            metadata.to_json_line()?.as_bytes(),
        )
        .await?;

        tracing::debug!(
            state_machine_id = %metadata.state_machine_id,
            snapshot_id = %metadata.snapshot_id,
            size_bytes = metadata.size_bytes,
            compressed = metadata.compressed,
            "Wrote snapshot"
        );
        Ok(metadata.snapshot_id.clone())
    }

    async fn load(
        &self,
        state_machine_id: &str,
        snapshot_id: &str,
    ) -> PersistResult<Option<(SnapshotMetadata, Vec<u8>)>> {
        let Some(metadata) = Self::read_metadata(&self.meta_path(state_machine_id, snapshot_id)).await? else {
            return Ok(None);
        };
        match fs::read(self.body_path(&metadata)).await {
            Ok(body) => Ok(Some((metadata, body))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, state_machine_id: &str) -> PersistResult<Vec<SnapshotMetadata>> {
        let dir = self.state_dir(state_machine_id);
        cleanup_temp_files(&dir).await?;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut listed = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(META_SUFFIX))
                .unwrap_or(false);
            if !is_meta {
                continue;
            }
            match Self::read_metadata(&path).await {
                Ok(Some(metadata)) if metadata.state_machine_id == state_machine_id => listed.push(metadata),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot sidecar");
                }
            }
        }

        sort_oldest_first(&mut listed);
        Ok(listed)
    }

    async fn delete(&self, state_machine_id: &str, snapshot_id: &str) -> PersistResult<bool> {
        let meta_path = self.meta_path(state_machine_id, snapshot_id);
        let Some(metadata) = Self::read_metadata(&meta_path).await? else {
            return Ok(false);
        };
        remove_if_exists(self.body_path(&metadata)).await?;
        Ok(remove_if_exists(&meta_path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateVersion;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn metadata(id: &str, snapshot_id: &str, age_minutes: i64, compressed: bool) -> SnapshotMetadata {
        SnapshotMetadata {
            snapshot_id: snapshot_id.to_string(),
            state_machine_id: id.to_string(),
            version: StateVersion::new(1, 0, 2),
            created_at: Utc::now() - Duration::minutes(age_minutes),
            size_bytes: 4,
            compressed,
            checksum: "deadbeef".to_string(),
            transition_count: 1,
            tags: vec!["manual".to_string()],
            ordinal: 0,
            sequence_number: None,
        }
    }

    #[tokio::test]
    async fn test_save_load_and_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(temp_dir.path()).await.unwrap();
        let meta = metadata("room/42", "s1", 0, true);

        store.save(&meta, b"body").await.unwrap();

        let dir = store.state_dir("room/42");
        assert!(dir.starts_with(temp_dir.path()));
        assert!(dir.ends_with("room_42"));
        assert!(dir.join("s1.json.gz").exists());
        assert!(dir.join("s1.meta.json").exists());

        let sidecar = std::fs::read_to_string(dir.join("s1.meta.json")).unwrap();
        assert!(sidecar.contains("\"version\":\"1.0.2\""));

        let (loaded, body) = store.load("room/42", "s1").await.unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(body, b"body");
        assert!(store.load("room/42", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sorted_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(temp_dir.path()).await.unwrap();
        store.save(&metadata("g1", "new", 1, false), b"n").await.unwrap();
        store.save(&metadata("g1", "old", 30, false), b"o").await.unwrap();

        let listed = store.list("g1").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.snapshot_id.as_str()).collect();
        assert_eq!(ids, vec!["old", "new"]);

        assert!(store.delete("g1", "old").await.unwrap());
        assert!(!store.delete("g1", "old").await.unwrap());
        assert_eq!(store.list("g1").await.unwrap().len(), 1);
        assert!(store.list("g2").await.unwrap().is_empty());
    }
}

//! File-backed storage
//!
//! Each key is stored as one JSON document at
//! `root/<h0h1>/<h2h3>/<sha256(key)>.json`, where the directory fan-out
//! comes from the hex digest so no single directory grows unbounded. The
//! file holds an envelope `{"key": ..., "value": ...}` so keys can be
//! recovered for prefix listing.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;

use super::StorageBackend;
use crate::error::{PersistError, PersistResult};
use crate::utils::{atomic_write, cleanup_temp_files, remove_if_exists};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    value: Value,
}

/// Durable key/value backend on the local filesystem
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Open (or create) a backend rooted at `root`
    pub async fn open<P: AsRef<Path>>(root: P) -> PersistResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(format!("{}.json", digest))
    }

    async fn read_envelope(path: &Path) -> PersistResult<Option<Envelope>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistError::storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Every `*.json` document path under the fan-out directories
    async fn document_paths(&self) -> io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            cleanup_temp_files(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.extension().map(|e| e == "json").unwrap_or(false) {
                    paths.push(path);
                }
            }
        }

        Ok(paths)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> PersistResult<Option<Value>> {
        let envelope = Self::read_envelope(&self.path_for(key)).await?;
        Ok(envelope.filter(|e| e.key == key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: Value) -> PersistResult<()> {
        let envelope = Envelope {
            key: key.to_string(),
            value,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        atomic_write(self.path_for(key), &bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> PersistResult<bool> {
        Ok(remove_if_exists(self.path_for(key)).await?)
    }

    async fn list_prefix(&self, prefix: &str) -> PersistResult<Vec<String>> {
        let mut keys = Vec::new();
        for path in self.document_paths().await? {
            match Self::read_envelope(&path).await {
                Ok(Some(envelope)) if envelope.key.starts_with(prefix) => keys.push(envelope.key),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable document");
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_backend_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::open(temp_dir.path()).await.unwrap();

        backend.set("states/g1", json!({"round": 2})).await.unwrap();
        assert_eq!(backend.get("states/g1").await.unwrap(), Some(json!({"round": 2})));
        assert!(backend.get("states/g2").await.unwrap().is_none());

        // Survives reopening
        let reopened = FileBackend::open(temp_dir.path()).await.unwrap();
        assert_eq!(reopened.get("states/g1").await.unwrap(), Some(json!({"round": 2})));
    }

    #[tokio::test]
    async fn test_file_backend_fan_out_layout() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::open(temp_dir.path()).await.unwrap();
        backend.set("k", json!(1)).await.unwrap();

        let digest = hex::encode(Sha256::digest(b"k"));
        let expected = temp_dir
            .path()
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(format!("{}.json", digest));
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_file_backend_list_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::open(temp_dir.path()).await.unwrap();
        for key in ["events/g1/2", "events/g1/1", "events/g2/1"] {
            backend.set(key, json!({})).await.unwrap();
        }

        assert_eq!(
            backend.list_prefix("events/g1/").await.unwrap(),
            vec!["events/g1/1", "events/g1/2"]
        );
        assert!(backend.delete("events/g1/1").await.unwrap());
        assert!(!backend.delete("events/g1/1").await.unwrap());
        assert_eq!(backend.list_prefix("events/").await.unwrap().len(), 2);
        assert!(backend.as_queryable().is_none());
    }
}

//! Local filesystem record store.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── 3f1c...e9.json        # One record per file, named by identity digest
//! └── 8a02...41.json
//! ```
//!
//! Writes go to a temp file and are renamed into place, so a crash never
//! leaves a half-written record. A process-wide write lock serializes the
//! revision check with the rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{Identity, ProgramRecord};
use crate::storage::{RecordStore, check_revision, next_revision};

/// Local filesystem storage backend.
pub struct LocalStore {
    root_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalStore {
    /// Create a new LocalStore rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    fn record_key(identity: &Identity) -> String {
        format!("{}.json", identity.digest())
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Write JSON data.
    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read JSON data.
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RecordStore for LocalStore {
    async fn get(&self, identity: &Identity) -> Result<Option<ProgramRecord>> {
        self.read_json(&Self::record_key(identity)).await
    }

    async fn upsert(&self, record: &ProgramRecord) -> Result<ProgramRecord> {
        let _guard = self.write_lock.lock().await;
        let key = Self::record_key(&record.identity);

        let current: Option<ProgramRecord> = self.read_json(&key).await?;
        check_revision(record, current.map(|r| r.revision))?;

        let stored = next_revision(record);
        self.write_json(&key, &stored).await?;
        log::debug!(
            "Stored {} at revision {} ({})",
            stored.identity,
            stored.revision,
            stored.stage
        );
        Ok(stored)
    }

    async fn list(&self) -> Result<Vec<ProgramRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.root_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("No record directory at {}", self.root_dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ProgramRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(records)
    }
}

//! Storage abstractions for program record persistence.
//!
//! Every backend implements optimistic concurrency: a record carries the
//! `revision` it was read at, and an upsert is accepted only when that still
//! matches the stored revision (`0` meaning "absent"). Accepted writes bump
//! the revision by one.
//!
//! ## Backends
//!
//! ```text
//! MemoryStore   in-process map (tests, dry runs)
//! LocalStore    {root}/{sha256(identity)}.json, atomic temp + rename
//! NotionStore   one Notion database page per record
//! ```

pub mod local;
pub mod memory;
pub mod notion;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{Identity, ProgramRecord};

// Re-export for convenience
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use notion::NotionStore;

/// Trait for record store backends.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a record by identity.
    async fn get(&self, identity: &Identity) -> Result<Option<ProgramRecord>>;

    /// Insert or update a record.
    ///
    /// Fails with [`AppError::StoreConflict`] when `record.revision` does not
    /// match the stored revision. Returns the record as stored.
    async fn upsert(&self, record: &ProgramRecord) -> Result<ProgramRecord>;

    /// All records in the store.
    async fn list(&self) -> Result<Vec<ProgramRecord>>;
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn get(&self, identity: &Identity) -> Result<Option<ProgramRecord>> {
        (**self).get(identity).await
    }

    async fn upsert(&self, record: &ProgramRecord) -> Result<ProgramRecord> {
        (**self).upsert(record).await
    }

    async fn list(&self) -> Result<Vec<ProgramRecord>> {
        (**self).list().await
    }
}

/// Compare the caller's revision to the stored one.
pub(crate) fn check_revision(record: &ProgramRecord, stored: Option<u64>) -> Result<()> {
    let found = stored.unwrap_or(0);
    if record.revision != found {
        return Err(AppError::StoreConflict {
            identity: record.identity.to_string(),
            expected: record.revision,
            found,
        });
    }
    Ok(())
}

/// Copy of `record` with the revision an accepted write assigns.
pub(crate) fn next_revision(record: &ProgramRecord) -> ProgramRecord {
    let mut stored = record.clone();
    stored.revision = record.revision + 1;
    stored
}

//! In-memory record store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::{Identity, ProgramRecord};
use crate::storage::{RecordStore, check_revision, next_revision};

/// Process-local store backed by a hash map.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Identity, ProgramRecord>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accepted writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, identity: &Identity) -> Result<Option<ProgramRecord>> {
        Ok(self.records.read().await.get(identity).cloned())
    }

    async fn upsert(&self, record: &ProgramRecord) -> Result<ProgramRecord> {
        let mut records = self.records.write().await;
        check_revision(record, records.get(&record.identity).map(|r| r.revision))?;

        let stored = next_revision(record);
        records.insert(stored.identity.clone(), stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn list(&self) -> Result<Vec<ProgramRecord>> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(all)
    }
}

//! Per-identity serialization.
//!
//! At most one transition per identity is in flight at any time. Locks are
//! created on demand and dropped from the table once nobody holds them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::models::Identity;

/// Prune dead entries once the table grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// Table of per-identity async locks.
#[derive(Default)]
pub struct IdentityLocks {
    table: Mutex<HashMap<Identity, Weak<AsyncMutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `identity`.
    pub async fn lock(&self, identity: &Identity) -> OwnedMutexGuard<()> {
        let lock = self.entry(identity);
        lock.lock_owned().await
    }

    fn entry(&self, identity: &Identity) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = table.get(identity).and_then(Weak::upgrade) {
            return existing;
        }

        if table.len() >= PRUNE_THRESHOLD {
            table.retain(|_, weak| weak.strong_count() > 0);
        }

        let lock = Arc::new(AsyncMutex::new(()));
        table.insert(identity.clone(), Arc::downgrade(&lock));
        lock
    }

    /// Number of identities with a live lock.
    #[cfg(test)]
    fn active(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.values().filter(|w| w.strong_count() > 0).count()
    }
}

//! Per-document write locks
//!
//! Add, update and remove on one document run one at a time, in arrival
//! order. Documents with different ids never wait on each other. A lock entry
//! lives in the registry only while some task holds or awaits it.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use ia_core::Id;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Keyed registry of document write locks
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<Id, Arc<Mutex<()>>>,
}

/// Held write lock; released on drop
pub struct WriteGuard<'a> {
    registry: &'a LockRegistry,
    id: Id,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents with a held or awaited lock
    pub fn active(&self) -> usize {
        self.locks.len()
    }

    /// Wait for exclusive access to document `id`
    ///
    /// Dropping the returned future while it waits leaves no registry entry
    /// behind.
    pub async fn write(&self, id: Id) -> WriteGuard<'_> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        // Declared before `acquire`, so on cancellation it drops after the
        // pending acquire has given up its reference.
        let mut held = WriteGuard {
            registry: self,
            id,
            guard: None,
        };
        let acquire = lock.lock_owned();
        held.guard = Some(acquire.await);
        debug!(doc_id = %id, "Write lock acquired");

        held
    }

    /// Run `critical` once no other write on document `id` is active
    ///
    /// The lock is released when `critical` completes, fails, panics or is
    /// dropped.
    pub async fn with_write_lock<F, T>(&self, id: Id, critical: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.write(id).await;
        critical.await
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let acquired = self.guard.take().is_some();
        // Only the registry's own reference left: nobody holds or awaits it
        self.registry
            .locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
        if acquired {
            debug!(doc_id = %self.id, "Write lock released");
        } else {
            debug!(doc_id = %self.id, "Write lock wait cancelled");
        }
    }
}

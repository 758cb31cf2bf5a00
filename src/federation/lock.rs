//! Per-IRI mutual exclusion
//!
//! Read-modify-write sequences on one federation object (create-if-absent,
//! apply update) hold an [`IriLockGuard`] for that IRI. The guard releases
//! on drop, so every exit path (`?`, early return, panic unwind) unlocks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type LockTable = HashMap<String, Arc<AsyncMutex<()>>>;

/// Table entry registration for one IRI. Dropping it prunes the entry
/// once nobody else holds or awaits the IRI, including when the waiting
/// future is cancelled before the mutex is acquired.
struct TableEntry {
    locks: IriLocks,
    iri: String,
}

impl Drop for TableEntry {
    fn drop(&mut self) {
        self.locks.release(&self.iri);
    }
}

/// RAII guard for one IRI. Dropping it releases the lock and prunes the
/// table entry once nobody else holds or awaits it.
pub struct IriLockGuard {
    // Declared before `_entry`: the mutex reference is gone by the time
    // the entry checks whether it may prune.
    _guard: OwnedMutexGuard<()>,
    _entry: TableEntry,
}

/// Table of reference-counted async mutexes keyed by IRI.
#[derive(Clone, Default)]
pub struct IriLocks {
    locks: Arc<Mutex<LockTable>>,
}

impl IriLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, iri: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(iri.to_string()).or_default().clone()
    }

    /// Wait for exclusive access to `iri`.
    pub async fn lock(&self, iri: &str) -> IriLockGuard {
        let entry = TableEntry {
            locks: self.clone(),
            iri: iri.to_string(),
        };
        let guard = self.handle(iri).lock_owned().await;
        trace!(%iri, "Acquired IRI lock");
        IriLockGuard {
            _guard: guard,
            _entry: entry,
        }
    }

    fn release(&self, iri: &str) {
        let mut locks = self.locks.lock();
        // The table's own reference is the only one left: nobody holds or
        // waits on this IRI any more.
        if locks
            .get(iri)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(iri);
            trace!(%iri, "Released IRI lock");
        }
    }

    /// Number of IRIs currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

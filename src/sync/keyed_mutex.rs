//! Fair keyed mutex built on `tokio::sync::Mutex`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// A table of async mutexes, one per key, created on demand.
///
/// Waiters on the same key are granted the lock in arrival order, because
/// `tokio::sync::Mutex` hands ownership to the oldest waiter on release.
/// There is no timeout: a holder that never releases stalls its key.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: Arc<LockTable>,
}

/// Exclusive section for one key. Releases on drop.
#[derive(Debug)]
pub struct KeyedMutexGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the exclusive section of `key`.
    pub async fn lock(&self, key: &str) -> KeyedMutexGuard {
        // The shard guard from `entry` must be gone before awaiting.
        let mutex = Arc::clone(
            &*self
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );

        let guard = mutex.lock_owned().await;
        trace!(key = %key, "Exclusive section acquired");

        KeyedMutexGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys with a holder or waiters.
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}

impl KeyedMutexGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedMutexGuard {
    fn drop(&mut self) {
        // Release first so the next waiter is handed the lock, then reclaim
        // the table entry if nobody else references it. Acquirers clone the
        // Arc under the shard lock that `remove_if` also takes.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!(key = %self.key, "Exclusive section released");
    }
}

//! Per-path mutual exclusion with a self-pruning lock table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    waiters: usize,
}

/// Named locks created on first use and dropped when the last holder or
/// waiter leaves.
#[derive(Default)]
pub struct PathLocker {
    table: Mutex<HashMap<String, Slot>>,
}

/// Held lock on one path. Releases and prunes the table entry on drop.
pub struct PathGuard<'a> {
    locker: &'a PathLocker,
    path: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl PathLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`.
    pub async fn lock(&self, path: &str) -> PathGuard<'_> {
        let lock = {
            let mut table = self.table.lock();
            let slot = table.entry(path.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                waiters: 0,
            });
            slot.waiters += 1;
            Arc::clone(&slot.lock)
        };
        // The guard exists before the await so a cancelled waiter still
        // gives back its count.
        let mut guard = PathGuard {
            locker: self,
            path: path.to_string(),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }

    /// Number of paths with a live lock object.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, path: &str) {
        let mut table = self.table.lock();
        if let Some(slot) = table.get_mut(path) {
            slot.waiters -= 1;
            if slot.waiters == 0 {
                table.remove(path);
            }
        }
    }
}

impl PathGuard<'_> {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        self.locker.release(&self.path);
    }
}

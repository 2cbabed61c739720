use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time;

use crate::error::ProxyError;

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
}

/// Per-key single-flight locks used to coalesce concurrent cache misses.
/// Slots are reference-counted and removed on last release, so the map does
/// not grow with the key space. Hits never touch this table.
pub struct LockTable {
    slots: Mutex<HashMap<String, Slot>>,
    timeout: Duration,
}

/// Held by the single in-flight fetch for a key; dropping it releases the
/// key for the next waiter.
pub struct KeyLock {
    key: String,
    table: Arc<LockTable>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        self.table.unref(&self.key);
    }
}

impl LockTable {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    /// Acquires the lock for `key`, waiting at most the configured timeout.
    /// A slow upstream holding the lock surfaces as `LockTimeout` to the
    /// callers queued behind it.
    pub async fn acquire(self: &Arc<Self>, key: &str) -> Result<KeyLock, ProxyError> {
        let mutex = {
            let mut slots = self.slots.lock().expect("lock table");
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.mutex)
        };

        match time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(KeyLock {
                key: key.to_string(),
                table: Arc::clone(self),
                _guard: guard,
            }),
            Err(_) => {
                self.unref(key);
                Err(ProxyError::LockTimeout)
            }
        }
    }

    fn unref(&self, key: &str) {
        let mut slots = self.slots.lock().expect("lock table");
        if let Some(slot) = slots.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().expect("lock table").len()
    }
}

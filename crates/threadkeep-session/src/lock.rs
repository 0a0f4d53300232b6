use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use threadkeep_core::SessionKey;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hands out one async mutex per session key.
///
/// Entries are dropped as soon as no guard or waiter refers to them, so the
/// map only ever holds keys with a commit in flight.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionKey, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn acquire(&self, key: &SessionKey) -> SessionGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        SessionGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a holder or waiter.
    pub fn active(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Exclusive access to one session key; released on drop.
pub struct SessionGuard<'a> {
    locks: &'a SessionLocks,
    key: SessionKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock();
        if let Some(lock) = locks.get(&self.key) {
            // Only the map still points at it: nobody is waiting.
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

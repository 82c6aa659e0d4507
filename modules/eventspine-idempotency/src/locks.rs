//! Per-key async locks.
//!
//! Every path that creates, replays or removes a receipt holds the key's lock,
//! which closes the check-then-execute-then-store race between concurrent
//! first attempts and keeps sweeps from deleting a receipt mid-creation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub(crate) struct KeyLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    /// Wait for exclusive access to `key`.
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self.entry(key);
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Take `key` only if nobody holds it right now.
    pub(crate) fn try_lock(&self, key: &str) -> Option<KeyGuard<'_>> {
        let lock = self.entry(key);
        match lock.try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                locks: self,
                key: key.to_string(),
                guard: Some(guard),
            }),
            Err(_) => None,
        }
    }

    /// Drop table entries nobody is holding or waiting on.
    pub(crate) fn prune(&self) {
        self.table.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.table
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.locks.table.lock();
        // Release under the table lock so no waiter can clone the entry between
        // the unlock and the strong-count check.
        self.guard.take();
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entry_is_removed_after_last_guard() {
        let locks = KeyLocks::default();
        {
            let _guard = locks.lock("k1").await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let locks = KeyLocks::default();
        let held = locks.lock("k1").await;

        assert!(locks.try_lock("k1").is_none());
        assert!(locks.try_lock("k2").is_some());

        drop(held);
        assert!(locks.try_lock("k1").is_some());
    }

    #[tokio::test]
    async fn prune_keeps_held_entries() {
        let locks = KeyLocks::default();
        let _held = locks.lock("busy").await;
        locks.prune();
        assert_eq!(locks.len(), 1);
    }
}

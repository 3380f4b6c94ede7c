//! Keyed async locks.
//!
//! One `tokio::sync::Mutex` per key. Used for `(exchange, symbol)` serialisation
//! in the executor and for per-connection token refresh. An entry lives only
//! while a guard or a waiter holds it; the last guard to drop removes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Default)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

/// Exclusive access to one key, released on drop
pub struct KeyedGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<LockMap>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Under the map lock no new holder can clone the entry, so a count
        // of one means only the map still references it
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let guard = self.lock_for(key).lock_owned().await;
        KeyedGuard {
            guard: Some(guard),
            key: key.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Keys currently held or waited on
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock key for one symbol on one venue
pub fn symbol_key(exchange_id: &str, symbol: &str) -> String {
    format!("{}::{}", exchange_id, symbol)
}

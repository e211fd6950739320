//! Per-key asynchronous mutual exclusion.
//!
//! Holders of the same key run one after another in arrival order (tokio's
//! mutex is fair); different keys never wait on each other. The returned
//! guard releases the key when dropped, so every exit path releases it.
//!
//! ```
//! # async fn demo() {
//! use thingcloud_common::lock::KeyedLock;
//!
//! let locks = KeyedLock::new();
//! let guard = locks.acquire(7).await;
//! // ... lifecycle work for key 7 ...
//! guard.release();
//! assert!(locks.is_empty());
//! # }
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

fn lock_slots<K>(slots: &Mutex<HashMap<K, Arc<AsyncMutex<()>>>>) -> MutexGuard<'_, HashMap<K, Arc<AsyncMutex<()>>>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A table of FIFO locks, one per key, created on demand.
pub struct KeyedLock<K> {
    slots: Slots<K>,
}

impl<K> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits for exclusive ownership of `key`.
    pub async fn acquire(&self, key: K) -> KeyedLockGuard<K> {
        let slot = {
            let mut slots = lock_slots(&self.slots);
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        KeyedLockGuard {
            slots: self.slots.clone(),
            key,
            slot,
            guard: Some(guard),
        }
    }

    /// Drops the entry for `key` if nobody holds or waits for it.
    pub fn forget(&self, key: &K) -> bool {
        let mut slots = lock_slots(&self.slots);
        match slots.get(key) {
            Some(slot) if Arc::strong_count(slot) == 1 => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one key of a [`KeyedLock`].
pub struct KeyedLockGuard<K: Eq + Hash> {
    slots: Slots<K>,
    key: K,
    slot: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> KeyedLockGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Releases the key. Same as dropping the guard.
    pub fn release(self) {}
}

impl<K: Eq + Hash> Drop for KeyedLockGuard<K> {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        drop(self.guard.take());
        // Table entry plus our own handle: nobody else is waiting.
        if Arc::strong_count(&self.slot) == 2 {
            if let Some(current) = slots.get(&self.key) {
                if Arc::ptr_eq(current, &self.slot) {
                    slots.remove(&self.key);
                }
            }
        }
    }
}

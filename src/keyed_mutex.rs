//! Named critical sections.
//!
//! Role locks keep one mining, validating or syncing cycle running per
//! process. Dedup locks keyed by a block hash turn at-least-once delivery into
//! at-most-once processing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub const MINING_LOCK: &str = "mining";
pub const VALIDATING_LOCK: &str = "validating";
pub const SYNCING_LOCK: &str = "syncing";

type Slot = Arc<AsyncMutex<()>>;

#[derive(Clone, Default)]
pub struct KeyedMutex {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

/// Holding this guard means holding the key. Dropping it releases.
pub struct KeyedGuard {
    key: String,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock();
        // Only the table itself still references the slot: no holder, no waiter.
        if let Some(slot) = slots.get(&self.key) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.key);
            }
        }
    }
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits until `key` is free, then holds it.
    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let slot = self.slot(key);
        let guard = slot.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Holds `key` if it is free right now.
    pub fn try_acquire(&self, key: &str) -> Option<KeyedGuard> {
        let slot = self.slot(key);
        // A failed attempt leaves cleanup to the current holder's guard.
        let guard = slot.try_lock_owned().ok()?;
        Some(KeyedGuard {
            key: key.to_string(),
            slots: self.slots.clone(),
            guard: Some(guard),
        })
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

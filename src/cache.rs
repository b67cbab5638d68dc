//! Caching layer for recently committed blocks
//!
//! Used to answer block-by-hash requests without opening a store
//! transaction, and to drop duplicate proposals before they reach the
//! validator's lock.
use crate::blockchain::{BlockData, Sha256Hash};
use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe LRU wrapper. Reads use `peek`, so lookups do not promote.
pub struct ThreadSafeLru<K, V> {
    cache: Arc<RwLock<LruCache<K, V>>>,
}

impl<K, V> ThreadSafeLru<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(RwLock::new(LruCache::new(capacity))),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.cache.read().await.peek(key).cloned()
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.cache.read().await.contains(key)
    }

    pub async fn put(&self, key: K, value: V) {
        self.cache.write().await.put(key, value);
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.cache.write().await.pop(key)
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    pub async fn capacity(&self) -> usize {
        self.cache.read().await.cap().get()
    }
}

impl<K, V> Clone for ThreadSafeLru<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

/// Cache for recently committed blocks
pub type BlockCache = ThreadSafeLru<Sha256Hash, BlockData>;

impl BlockCache {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub async fn insert_block(&self, block: &BlockData) {
        self.put(block.hash, block.clone()).await;
    }

    pub async fn stats(&self) -> (usize, usize) {
        (self.len().await, self.capacity().await)
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

//! Bounded key/value cache backing the local storage.
//!
//! Values are JSON text keyed by the `@`-joined key path. The cache has a
//! byte budget (key plus value length); overflowing it evicts least
//! recently used entries.

use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Key/value capability consumed by [`crate::LocalStorage`].
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str) -> Option<String>;
    fn keys(&self) -> Vec<String>;
}

/// Cache statistics for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Hit ratio between 0.0 and 1.0.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

struct Inner {
    entries: LruCache<String, String>,
    used: usize,
}

/// LRU cache bounded by a byte budget.
pub struct LruStore {
    inner: Mutex<Inner>,
    budget: usize,
    stats: CacheStats,
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

impl LruStore {
    /// Create a cache holding at most `budget` bytes.
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used: 0,
            }),
            budget,
            stats: CacheStats::default(),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Bytes currently held.
    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl KeyValueStore for LruStore {
    fn get(&self, key: &str) -> Option<String> {
        let value = self.inner.lock().entries.get(key).cloned();
        let counter = if value.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    fn set(&self, key: &str, value: String) {
        let mut inner = self.inner.lock();
        let size = entry_size(key, &value);
        if let Some(old) = inner.entries.put(key.to_string(), value) {
            inner.used -= entry_size(key, &old);
        }
        inner.used += size;

        // The entry just written is most recent, so it goes last.
        while inner.used > self.budget && inner.entries.len() > 1 {
            match inner.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.used -= entry_size(&evicted_key, &evicted);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %evicted_key, "evicted cache entry");
                }
                None => break,
            }
        }
    }

    fn remove(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.pop(key);
        if let Some(value) = &removed {
            inner.used -= entry_size(key, value);
        }
        removed
    }

    fn keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }
}

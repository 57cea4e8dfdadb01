//! Time-boxed memoization used by the verdict and inode caches.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default entry lifetime; expired entries are purged lazily and the whole
/// map is swept at most every 2×TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    next_sweep: Instant,
}

/// Concurrent map whose entries expire after a fixed TTL.
///
/// Entries are immutable within their TTL window; concurrent writers for the
/// same key are last-write-wins. Lookups never block for longer than the
/// internal mutex.
pub struct TtlCache<K, V> {
    ttl: Duration,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                next_sweep: Instant::now() + ttl * 2,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match inner.map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                inner.map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.next_sweep <= now {
            inner.map.retain(|_, entry| entry.expires_at > now);
            inner.next_sweep = now + self.ttl * 2;
        }
        inner.map.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Drops every entry, expired or not.
    pub fn flush(&self) {
        self.inner.lock().expect("cache lock poisoned").map.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash, V: Clone> Default for TtlCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn expired_entry_is_gone() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn last_write_wins() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn flush_clears_everything() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.flush();
        assert!(cache.is_empty());
    }
}

// =============================================================================
// Generic bounded cache with TTL-based eviction
// =============================================================================
//
// Shared by the Open-Price Cache and the event-loop-scale admission memo.
// Writers contend only on the single key (bucket) they are touching —
// `DashMap` shards its internal locks per key, giving the concurrent-LRU
// behaviour called for by the resource model without a global mutex.
//
// Eviction is two-pronged:
//   - `sweep_expired` drops entries older than `ttl`, called periodically.
//   - `insert` enforces `max_entries` by evicting the single oldest entry
//     when the cache is at capacity and the key is new. This approximates
//     LRU-by-insertion-order rather than true access-order LRU, which is
//     sufficient for a cache whose entries naturally age out via TTL anyway.
// =============================================================================

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct LruTtlCache<K, V> {
    map: DashMap<K, Entry<V>>,
    max_entries: usize,
    ttl: Duration,
}

impl<K, V> LruTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            map: DashMap::new(),
            max_entries,
            ttl,
        }
    }

    /// Fetch a value if present and not expired. An expired entry is removed
    /// lazily on read.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.map.get(key) {
            if entry.inserted_at.elapsed() <= self.ttl {
                return Some(entry.value.clone());
            }
        }
        // Either absent or expired — drop if expired.
        self.map.remove(key);
        None
    }

    /// Insert or replace a value. If the cache is at capacity and `key` is
    /// new, evicts the single oldest entry first.
    pub fn insert(&self, key: K, value: V) {
        if !self.map.contains_key(&key) && self.map.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.map.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove every entry older than `ttl`. Intended to be driven by a
    /// periodic sweep timer.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.map.len();
        self.map.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        before - self.map.len()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest_key = self
            .map
            .iter()
            .min_by_key(|r| r.value().inserted_at)
            .map(|r| r.key().clone());
        if let Some(k) = oldest_key {
            self.map.remove(&k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn insert_and_get_roundtrip() {
        let cache: LruTtlCache<&str, i32> = LruTtlCache::new(10, Duration::from_secs(60));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"missing"), None);
    }

    #[test]
    fn expired_entries_are_dropped_on_read() {
        let cache: LruTtlCache<&str, i32> = LruTtlCache::new(10, Duration::from_millis(20));
        cache.insert("a", 1);
        sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn capacity_eviction_keeps_bound() {
        let cache: LruTtlCache<i32, i32> = LruTtlCache::new(3, Duration::from_secs(60));
        for i in 0..5 {
            cache.insert(i, i);
            sleep(Duration::from_millis(2));
        }
        assert!(cache.len() <= 3);
    }

    #[test]
    fn sweep_expired_removes_only_old_entries() {
        let cache: LruTtlCache<i32, i32> = LruTtlCache::new(100, Duration::from_millis(20));
        cache.insert(1, 1);
        sleep(Duration::from_millis(40));
        cache.insert(2, 2);
        let removed = cache.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(cache.get(&2), Some(2));
    }
}

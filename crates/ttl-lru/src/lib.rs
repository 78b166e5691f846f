use lru_cache::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::borrow::Borrow;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Bounded associative cache with per-entry TTL and LRU eviction.
///
/// Reading a fresh entry promotes it to most-recently-used. Reading a
/// stale entry evicts it and counts as a miss. Inserting into a full
/// cache evicts the least-recently-used entry first.
pub struct TtlLruCache<K: Eq + Hash + Clone, V: Clone> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    sweep_probability: f64,
}

struct Inner<K: Eq + Hash, V> {
    cache: LruCache<K, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Clone)]
struct Entry<V> {
    value: V,
    expires: Instant,
}

/// Point-in-time counters for one cache instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
}

const DEFAULT_SWEEP_PROBABILITY: f64 = 0.1;

impl<K: Eq + Hash + Clone, V: Clone> TtlLruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self::with_sweep_probability(capacity, DEFAULT_SWEEP_PROBABILITY)
    }

    /// `sweep_probability` is the chance that an insert into a non-empty
    /// cache first walks the cache and drops every expired entry.
    pub fn with_sweep_probability(capacity: usize, sweep_probability: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity,
            sweep_probability,
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // get_mut promotes the entry to most-recently-used
        let found = match inner.cache.get_mut(key) {
            Some(entry) if Instant::now() < entry.expires => Some(Some(entry.value.clone())),
            Some(_) => Some(None),
            None => None,
        };

        match found {
            Some(Some(value)) => {
                inner.hits += 1;
                Some(value)
            }
            Some(None) => {
                inner.cache.remove(key);
                inner.misses += 1;
                inner.evictions += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.cache.is_empty() && rand::thread_rng().gen_bool(self.sweep_probability) {
            let now = Instant::now();
            let expired: Vec<K> = inner
                .cache
                .iter()
                .filter(|(_, entry)| entry.expires <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for k in &expired {
                inner.cache.remove(k);
            }
            inner.evictions += expired.len() as u64;
        }

        if inner.cache.len() == self.capacity && !inner.cache.contains_key(&key) {
            inner.cache.remove_lru();
            inner.evictions += 1;
        }

        inner.cache.insert(
            key,
            Entry {
                value,
                expires: Instant::now() + ttl,
            },
        );
    }

    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.inner.lock().cache.remove(key).is_some()
    }

    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.cache.len();
        inner.cache.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.cache.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ttl() -> Duration {
        Duration::from_secs(60)
    }

    #[test]
    fn basic_get_set() {
        let cache: TtlLruCache<String, u32> = TtlLruCache::new(4);
        assert_eq!(cache.get("foo"), None);
        cache.insert("foo".to_string(), 42, ttl());
        assert_eq!(cache.get("foo"), Some(42));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lru_eviction_order() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::with_sweep_probability(3, 0.0);
        cache.insert(1, 1, ttl());
        cache.insert(2, 2, ttl());
        cache.insert(3, 3, ttl());

        // Touch 1 so that 2 becomes the least-recently-used entry
        assert_eq!(cache.get(&1), Some(1));

        cache.insert(4, 4, ttl());
        assert_eq!(cache.get(&2), None, "2 was LRU and must be gone");
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&3), Some(3));
        assert_eq!(cache.get(&4), Some(4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn capacity_never_exceeded() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::with_sweep_probability(5, 0.0);
        for i in 0..50 {
            cache.insert(i, i, ttl());
            assert!(cache.len() <= 5);
        }
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn stale_read_counts_as_miss_and_eviction() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::with_sweep_probability(4, 0.0);
        cache.insert("soon", 1, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get("soon"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::with_sweep_probability(8, 1.0);
        cache.insert(1, 1, Duration::from_millis(5));
        cache.insert(2, 2, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(25));
        cache.insert(3, 3, ttl());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn replacing_existing_key_does_not_evict() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::with_sweep_probability(2, 0.0);
        cache.insert(1, 1, ttl());
        cache.insert(2, 2, ttl());
        cache.insert(2, 20, ttl());
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn hit_rate_math() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(4);
        assert_eq!(cache.stats().hit_rate, 0.0);

        cache.insert("a", 1, ttl());
        cache.get("a");
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        k9::assert_equal!(stats.hit_rate, 2.0 / 3.0);
    }

    #[test]
    fn delete_and_flush() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(4);
        cache.insert("a", 1, ttl());
        cache.insert("b", 2, ttl());
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.flush(), 1);
        assert!(cache.is_empty());
    }
}

mod conglomerate;

pub use conglomerate::ConglomerateCache;

use crate::error::AccessError;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub generation: u64,
}

struct CacheInner<K: Hash + Eq, V: ?Sized> {
    /// `None` once the cache has been shut down.
    entries: Option<LruCache<K, Arc<V>>>,
    capacity: NonZeroUsize,
    /// Bumped by every removal so in-flight fills can tell they are stale.
    generation: u64,
    hits: u64,
    misses: u64,
}

/// Bounded keyed cache of shared values. Entries stay valid for callers that
/// hold an `Arc` after eviction; only the cache's own reference is dropped.
pub struct CacheManager<K: Hash + Eq, V: ?Sized> {
    name: &'static str,
    inner: Mutex<CacheInner<K, V>>,
}

impl<K, V> CacheManager<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug,
    V: ?Sized,
{
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            inner: Mutex::new(CacheInner {
                entries: Some(LruCache::new(capacity)),
                capacity,
                generation: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn closed(&self) -> AccessError {
        AccessError::IllegalState(format!("{} cache has been shut down", self.name))
    }

    /// Returns the cached value or runs `fill` without holding the cache
    /// lock. The filled value is only inserted if nothing was removed while
    /// `fill` ran.
    pub fn find<F>(&self, key: &K, fill: F) -> Result<Option<Arc<V>>, AccessError>
    where
        F: FnOnce(&K) -> Result<Option<Arc<V>>, AccessError>,
    {
        let generation = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            let entries = inner.entries.as_mut().ok_or_else(|| self.closed())?;
            if let Some(hit) = entries.get(key) {
                let hit = Arc::clone(hit);
                inner.hits += 1;
                return Ok(Some(hit));
            }
            inner.misses += 1;
            inner.generation
        };

        let Some(value) = fill(key)? else {
            return Ok(None);
        };

        let mut inner = self.inner.lock();
        let current = inner.generation;
        let entries = inner.entries.as_mut().ok_or_else(|| self.closed())?;
        if current != generation {
            debug!(cache = self.name, ?key, "stale fill not cached");
            return Ok(Some(value));
        }
        if let Some(raced) = entries.get(key) {
            return Ok(Some(Arc::clone(raced)));
        }
        entries.put(key.clone(), Arc::clone(&value));
        debug!(cache = self.name, ?key, "cache filled");
        Ok(Some(value))
    }

    pub fn find_cached(&self, key: &K) -> Result<Option<Arc<V>>, AccessError> {
        let mut inner = self.inner.lock();
        let entries = inner.entries.as_mut().ok_or_else(|| self.closed())?;
        Ok(entries.get(key).cloned())
    }

    /// Inserts `value` unless the key is already present. Returns whether it
    /// was inserted.
    pub fn create(&self, key: K, value: Arc<V>) -> Result<bool, AccessError> {
        let mut inner = self.inner.lock();
        let entries = inner.entries.as_mut().ok_or_else(|| self.closed())?;
        if entries.contains(&key) {
            return Ok(false);
        }
        entries.put(key, value);
        Ok(true)
    }

    pub fn replace(&self, key: K, value: Arc<V>) -> Result<(), AccessError> {
        let mut inner = self.inner.lock();
        let entries = inner.entries.as_mut().ok_or_else(|| self.closed())?;
        entries.put(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &K) -> Result<Option<Arc<V>>, AccessError> {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let entries = inner.entries.as_mut().ok_or_else(|| self.closed())?;
        Ok(entries.pop(key))
    }

    /// Drops every entry.
    pub fn age_out(&self) -> Result<usize, AccessError> {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let entries = inner.entries.as_mut().ok_or_else(|| self.closed())?;
        let dropped = entries.len();
        entries.clear();
        Ok(dropped)
    }

    /// Empties the cache for good; later calls fail with `IllegalState`.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.entries = None;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.as_ref().map_or(0, |e| e.len()),
            capacity: inner.capacity.get(),
            hits: inner.hits,
            misses: inner.misses,
            generation: inner.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CacheManager;
    use crate::error::AccessError;
    use std::sync::Arc;

    #[test]
    fn fill_runs_once_and_hits_afterwards() {
        let cache: CacheManager<u32, str> = CacheManager::new("test", 4);
        let first = cache
            .find(&1, |_| Ok(Some(Arc::from("one"))))
            .expect("fill")
            .expect("value");
        let second = cache
            .find(&1, |_| unreachable!("cached"))
            .expect("hit")
            .expect("value");
        assert!(Arc::ptr_eq(&first, &second));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn missing_values_are_not_cached() {
        let cache: CacheManager<u32, str> = CacheManager::new("test", 4);
        assert!(cache.find(&9, |_| Ok(None)).expect("miss").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn removal_during_fill_keeps_the_stale_value_out() {
        let cache: CacheManager<u32, str> = CacheManager::new("test", 4);
        let value = cache
            .find(&1, |_| {
                cache.remove(&1).expect("remove");
                Ok(Some(Arc::from("stale")))
            })
            .expect("fill")
            .expect("value");
        assert_eq!(&*value, "stale");
        assert!(cache.find_cached(&1).expect("lookup").is_none());
    }

    #[test]
    fn capacity_bounds_entries_and_shutdown_is_final() {
        let cache: CacheManager<u32, str> = CacheManager::new("test", 2);
        for k in 0..3 {
            assert!(cache.create(k, Arc::from("v")).expect("create"));
        }
        assert!(!cache.create(2, Arc::from("again")).expect("present"));
        assert_eq!(cache.stats().entries, 2);
        assert!(cache.find_cached(&0).expect("lookup").is_none());
        assert_eq!(cache.age_out().expect("age out"), 2);

        cache.shutdown();
        assert!(matches!(
            cache.find(&1, |_| Ok(None)),
            Err(AccessError::IllegalState(_))
        ));
    }
}

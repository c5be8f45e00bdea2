//! In-process TTL cache with bounded size.
//!
//! All operations serialize on a single mutex guarding the whole store.
//! Every `get` and `set` first sweeps expired entries, so the cost is linear
//! in the current size. When full, the entry closest to expiry is evicted.

use log::debug;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// Longest lifetime an entry can actually get; larger TTLs saturate to it.
const MAX_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_LIFETIME))
        .or_else(|| now.checked_add(Duration::from_secs(u32::MAX as u64)))
        .unwrap_or(now)
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    max_size: usize,
    store: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `max_size` below 1 is treated as 1.
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size: max_size.max(1),
            store: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_expired(store: &mut HashMap<K, CacheEntry<V>>, now: Instant) {
        let before = store.len();
        store.retain(|_, entry| !entry.is_expired(now));
        let purged = before - store.len();
        if purged > 0 {
            debug!("TTL cache purged {} expired entries", purged);
        }
    }

    /// Returns the cached value, or `None` if missing or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut store = self.lock();
        Self::purge_expired(&mut store, now);
        store.get(key).map(|entry| entry.value.clone())
    }

    /// Inserts `value` with the cache-wide TTL.
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    /// Inserts `value` expiring `ttl` from now.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut store = self.lock();
        Self::purge_expired(&mut store, now);

        // At capacity an entry is evicted even when `key` is already present.
        if store.len() >= self.max_size {
            let soonest = store
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(evicted) = soonest {
                store.remove(&evicted);
                debug!("TTL cache full ({} entries), evicted soonest-to-expire entry", self.max_size);
            }
        }

        store.insert(
            key,
            CacheEntry {
                value,
                expires_at: expiry_after(now, ttl),
            },
        );
    }

    /// Returns the cached value or computes, stores and returns it.
    ///
    /// The factory runs outside the lock. Two concurrent misses on the same
    /// key may both run it; the last `set` wins.
    pub fn get_or_set<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(cached) = self.get(&key) {
            return cached;
        }
        let value = factory();
        self.set(key, value.clone());
        value
    }

    /// Fallible `get_or_set`: a factory error is returned and nothing is cached.
    pub fn try_get_or_set<F, E>(&self, key: K, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(cached) = self.get(&key) {
            return Ok(cached);
        }
        let value = factory()?;
        self.set(key, value.clone());
        Ok(value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key).map(|entry| entry.value)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut store = self.lock();
        Self::purge_expired(&mut store, now);
        store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

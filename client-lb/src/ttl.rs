use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

struct Slot<V> {
    value: V,
    expires_at_ms: AtomicU64,
}

impl<V> Slot<V> {
    fn new(value: V, expires_at_ms: u64) -> Self {
        Self {
            value,
            expires_at_ms: AtomicU64::new(expires_at_ms),
        }
    }

    fn expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.load(Ordering::Relaxed) <= now_ms
    }
}

/// Concurrent map whose entries disappear after a deadline.
///
/// Expiry is lazy: a stale entry is dropped by the read that finds it, or by
/// an explicit [`TtlMap::sweep`]. Readers only take a shard read lock.
pub struct TtlMap<K, V> {
    origin: Instant,
    entries: DashMap<K, Slot<V>>,
}

impl<K, V> Default for TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            entries: DashMap::new(),
        }
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn deadline(now_ms: u64, ttl: Duration) -> u64 {
        now_ms.saturating_add(ttl.as_millis() as u64)
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        self.insert_at(key, value, ttl, self.now_ms());
    }

    /// Inserts or overwrites, the previous deadline is discarded.
    pub fn insert_at(&self, key: K, value: V, ttl: Duration, now_ms: u64) {
        self.entries.insert(key, Slot::new(value, Self::deadline(now_ms, ttl)));
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, self.now_ms())
    }

    pub fn get_at(&self, key: &K, now_ms: u64) -> Option<V> {
        {
            let slot = self.entries.get(key)?;
            if !slot.expired(now_ms) {
                return Some(slot.value.clone());
            }
        }
        // the read guard must be gone before taking the write lock
        self.entries.remove_if(key, |_, slot| slot.expired(now_ms));
        None
    }

    pub fn contains_at(&self, key: &K, now_ms: u64) -> bool {
        self.get_at(key, now_ms).is_some()
    }

    /// Returns the live value and pushes its deadline to `now + idle_ttl`,
    /// creating it with `f` when missing or expired.
    pub fn get_or_insert_with<F>(&self, key: K, idle_ttl: Duration, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.get_or_insert_with_at(key, idle_ttl, self.now_ms(), f)
    }

    pub fn get_or_insert_with_at<F>(&self, key: K, idle_ttl: Duration, now_ms: u64, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        let deadline = Self::deadline(now_ms, idle_ttl);

        // fast path, shard read lock only
        if let Some(slot) = self.entries.get(&key)
            && !slot.expired(now_ms)
        {
            slot.expires_at_ms.fetch_max(deadline, Ordering::Relaxed);
            return slot.value.clone();
        }

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expired(now_ms) {
                    occupied.insert(Slot::new(f(), deadline));
                } else {
                    occupied.get().expires_at_ms.fetch_max(deadline, Ordering::Relaxed);
                }
                occupied.get().value.clone()
            }
            Entry::Vacant(vacant) => vacant.insert(Slot::new(f(), deadline)).value.clone(),
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, slot)| slot.value)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(self.now_ms())
    }

    /// Drops every expired entry, returns how many went away.
    pub fn sweep_at(&self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.expired(now_ms));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_at(&self, now_ms: u64) -> Vec<(K, V)> {
        self.entries
            .iter()
            .filter(|e| !e.value().expired(now_ms))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.entries_at(self.now_ms())
    }
}

//! Expiring Volatile Cache Module
//!
//! Process-lifetime map from canonical key to a timestamped record. Lookups
//! never perform I/O; freshness is decided per request from the caller's
//! max age rather than from a TTL fixed at insertion.

use std::collections::HashMap;

use crate::cache::{current_timestamp_ms, CacheEntry, LruTracker, MaxAge};

// == Expiring Volatile Cache ==
/// In-memory tier with optional LRU capacity bound.
#[derive(Debug)]
pub struct ExpiringVolatileCache<V> {
    /// Canonical key -> entry
    entries: HashMap<String, CacheEntry<V>>,
    /// Recency order, only maintained when a capacity is set
    lru: LruTracker,
    /// Maximum number of entries, 0 = unbounded
    capacity: usize,
    /// Entries dropped by the capacity bound or purges
    evictions: u64,
}

impl<V: Clone> ExpiringVolatileCache<V> {
    // == Constructor ==
    /// Creates an empty cache. A capacity of 0 disables eviction.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            capacity,
            evictions: 0,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    // == Get ==
    /// Returns the entry if present and admitted by `max_age`, None (miss)
    /// otherwise. Stale entries are kept: a later caller may accept them.
    pub fn get(&mut self, key: &str, max_age: MaxAge) -> Option<CacheEntry<V>> {
        self.get_at(key, max_age, current_timestamp_ms())
    }

    /// Same as [`get`](Self::get) evaluated at an explicit time.
    pub fn get_at(&mut self, key: &str, max_age: MaxAge, now_ms: u64) -> Option<CacheEntry<V>> {
        let entry = self.entries.get(key)?;
        if !entry.is_fresh(max_age, now_ms) {
            return None;
        }
        let entry = entry.clone();
        if self.capacity > 0 {
            self.lru.touch(key);
        }
        Some(entry)
    }

    // == Set ==
    /// Stores `(value, now)`, overwriting any prior entry.
    pub fn set(&mut self, key: &str, value: Option<V>) {
        self.set_entry(key, CacheEntry::new(value));
    }

    /// Stores a prepared entry, keeping its timestamp.
    pub fn set_entry(&mut self, key: &str, entry: CacheEntry<V>) {
        let is_overwrite = self.entries.contains_key(key);

        if !is_overwrite && self.capacity > 0 && self.entries.len() >= self.capacity {
            if let Some(evicted) = self.lru.evict_oldest() {
                self.entries.remove(&evicted);
                self.evictions += 1;
            }
        }

        self.entries.insert(key.to_string(), entry);
        if self.capacity > 0 {
            self.lru.touch(key);
        }
    }

    /// Stores `entry` unless the present entry was filled later. Returns the
    /// entry left in the cache.
    pub fn set_if_newer(&mut self, key: &str, entry: CacheEntry<V>) -> CacheEntry<V> {
        if let Some(current) = self.entries.get(key) {
            if current.timestamp_ms > entry.timestamp_ms {
                return current.clone();
            }
        }
        self.set_entry(key, entry.clone());
        entry
    }

    /// Inserts only when no entry exists. Returns true if inserted.
    pub fn insert_if_absent(&mut self, key: &str, value: Option<V>) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.set(key, value);
        true
    }

    // == Delete ==
    /// Removes the entry for a key. Returns true if one existed.
    pub fn delete(&mut self, key: &str) -> bool {
        self.lru.remove(key);
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
    }

    // == Purge ==
    /// Removes every entry older than `retention_ms` at `now_ms`.
    ///
    /// Returns the number of entries removed.
    pub fn purge_older_than(&mut self, retention_ms: u64, now_ms: u64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.age_ms(now_ms) > retention_ms)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            self.lru.remove(key);
        }

        self.evictions += expired.len() as u64;
        expired.len()
    }

    /// Returns true if any entry, fresh or stale, exists for the key.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

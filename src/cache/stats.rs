//! Cache Statistics Module
//!
//! Tracks tier hits, upstream traffic and evictions.

use serde::Serialize;

// == Cache Stats ==
/// Counters describing how requests were answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Requests answered from the volatile tier
    pub volatile_hits: u64,
    /// Requests answered from the persistent tier
    pub persistent_hits: u64,
    /// Requests that had to go to the loader
    pub misses: u64,
    /// Upstream fetch_many calls issued
    pub upstream_calls: u64,
    /// Distinct keys sent upstream
    pub upstream_keys: u64,
    /// Requests that shared an already pending fetch
    pub coalesced: u64,
    /// Volatile entries dropped by the capacity bound or the sweep
    pub evictions: u64,
    /// Current number of volatile entries
    pub total_entries: usize,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Fraction of requests answered by either cache tier, 0.0 if none.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.volatile_hits + self.persistent_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn record_volatile_hit(&mut self) {
        self.volatile_hits += 1;
    }

    pub fn record_persistent_hit(&mut self) {
        self.persistent_hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_upstream_call(&mut self, keys: usize) {
        self.upstream_calls += 1;
        self.upstream_keys += keys as u64;
    }

    pub fn record_coalesced(&mut self) {
        self.coalesced += 1;
    }

    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}

//! Cache Entry Module
//!
//! Defines cached records with their fill timestamp and the freshness bound
//! callers use to accept or reject them.

use std::fmt::Display;
use std::time::Duration;

use chrono::Utc;

// == Cache Key ==
/// Identifier of a cached record. Two keys are the same key when their
/// canonical strings are equal, regardless of object identity.
pub trait CacheKey: Clone + Send + Sync + 'static {
    fn cache_key(&self) -> String;
}

impl<T> CacheKey for T
where
    T: Display + Clone + Send + Sync + 'static,
{
    fn cache_key(&self) -> String {
        self.to_string()
    }
}

// == Max Age ==
/// Caller-supplied freshness bound for a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MaxAge {
    /// Any cached value is acceptable regardless of age
    #[default]
    Unbounded,
    /// Only values no older than the given duration are acceptable.
    /// A zero duration never accepts a cached value.
    Within(Duration),
}

impl MaxAge {
    /// A bound that always forces an upstream fetch.
    pub const FRESH: MaxAge = MaxAge::Within(Duration::ZERO);

    pub fn from_millis(ms: u64) -> Self {
        MaxAge::Within(Duration::from_millis(ms))
    }

    pub fn from_secs(secs: u64) -> Self {
        MaxAge::Within(Duration::from_secs(secs))
    }

    // == Admits ==
    /// Returns true if a value of the given age satisfies this bound.
    ///
    /// Boundary condition: an age exactly equal to the bound is admitted.
    pub fn admits(&self, age_ms: u64) -> bool {
        match self {
            MaxAge::Unbounded => true,
            MaxAge::Within(bound) if bound.is_zero() => false,
            MaxAge::Within(bound) => u128::from(age_ms) <= bound.as_millis(),
        }
    }

    /// True for the bound that never accepts cached values.
    pub fn forces_fetch(&self) -> bool {
        matches!(self, MaxAge::Within(bound) if bound.is_zero())
    }
}

impl From<Duration> for MaxAge {
    fn from(bound: Duration) -> Self {
        MaxAge::Within(bound)
    }
}

// == Cache Entry ==
/// A resolved record and the time it was filled.
///
/// `value: None` means the record is confirmed absent upstream. An unknown
/// record has no entry at all.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    /// The record, or None when confirmed absent
    pub value: Option<V>,
    /// Fill timestamp (Unix milliseconds)
    pub timestamp_ms: u64,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates an entry stamped with the current time.
    pub fn new(value: Option<V>) -> Self {
        Self::with_timestamp(value, current_timestamp_ms())
    }

    pub fn with_timestamp(value: Option<V>, timestamp_ms: u64) -> Self {
        Self {
            value,
            timestamp_ms,
        }
    }

    // == Age ==
    /// Milliseconds elapsed since the fill, relative to `now_ms`.
    ///
    /// Timestamps in the future count as age zero.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }

    // == Is Fresh ==
    /// Checks the entry against a freshness bound at `now_ms`.
    pub fn is_fresh(&self, max_age: MaxAge, now_ms: u64) -> bool {
        max_age.admits(self.age_ms(now_ms))
    }

    pub fn is_absent(&self) -> bool {
        self.value.is_none()
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_admits_everything() {
        assert!(MaxAge::Unbounded.admits(0));
        assert!(MaxAge::Unbounded.admits(u64::MAX));
        assert_eq!(MaxAge::default(), MaxAge::Unbounded);
    }

    #[test]
    fn test_zero_never_admits() {
        assert!(!MaxAge::FRESH.admits(0));
        assert!(MaxAge::FRESH.forces_fetch());
        assert!(!MaxAge::Unbounded.forces_fetch());
    }

    #[test]
    fn test_within_boundary() {
        let bound = MaxAge::from_secs(10);
        assert!(bound.admits(9_999));
        assert!(bound.admits(10_000));
        assert!(!bound.admits(10_001));
    }

    #[test]
    fn test_entry_age_and_freshness() {
        let entry = CacheEntry::with_timestamp(Some("v"), 1_000);

        assert_eq!(entry.age_ms(6_000), 5_000);
        assert!(entry.is_fresh(MaxAge::from_secs(10), 6_000));
        assert!(!entry.is_fresh(MaxAge::from_secs(10), 31_000));
    }

    #[test]
    fn test_future_timestamp_counts_as_new() {
        let entry = CacheEntry::with_timestamp(Some(1u8), 10_000);
        assert_eq!(entry.age_ms(5_000), 0);
    }

    #[test]
    fn test_absent_entry() {
        let entry: CacheEntry<String> = CacheEntry::new(None);
        assert!(entry.is_absent());
        assert!(entry.timestamp_ms > 0);
    }
}

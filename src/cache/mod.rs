//! Cache Module
//!
//! The volatile tier: timestamped entries, freshness bounds, optional LRU
//! capacity and statistics.

mod entry;
mod lru;
mod stats;
mod volatile;


// Re-export public types
pub use entry::{current_timestamp_ms, CacheEntry, CacheKey, MaxAge};
pub use lru::LruTracker;
pub use stats::CacheStats;
pub use volatile::ExpiringVolatileCache;

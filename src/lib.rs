//! Record Cache - batched loading with a two-tier freshness cache
//!
//! Remote records are requested by key. Concurrent requests are coalesced into
//! batch windows and fetched with one upstream call per window. Results are
//! kept in a volatile in-process tier and a persistent per-partition store;
//! every request states the maximum age it accepts.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod loader;
pub mod models;
pub mod parser;
pub mod record;
pub mod record_cache;
pub mod store;
pub mod tasks;

pub use api::AppState;
pub use cache::{CacheEntry, CacheKey, CacheStats, MaxAge};
pub use config::Config;
pub use error::{CacheError, Result};
pub use loader::{BatchFetch, BatchedLoader, LoadResult, LoaderOptions, RateLimitPolicy};
pub use parser::{NoParsers, ParseError, ParserTable};
pub use record::{RecordKey, RemoteRecord};
pub use record_cache::{Loaded, RecordCache};
pub use store::{PersistentStore, StoreProvider};
pub use tasks::spawn_sweep_task;

//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::loader::RateLimitPolicy;

/// Default upstream chunk size, matching the usual RPC limit for multi-key reads.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Logical partition (network/environment name) the store is namespaced by
    pub partition: String,
    /// Maximum number of keys per upstream call
    pub max_batch_size: usize,
    /// Extra time a batch window stays open after the first request
    pub batch_delay: Duration,
    /// Maximum number of volatile entries, 0 = unbounded
    pub volatile_capacity: usize,
    /// Age after which the sweep task drops volatile entries, None = never
    pub volatile_retention: Option<Duration>,
    /// Interval between volatile sweeps
    pub sweep_interval: Duration,
    /// Upstream token refill rate, None = no rate limiting
    pub rate_limit_per_second: Option<u32>,
    /// Token bucket size
    pub rate_limit_burst: u32,
    /// What a single token pays for
    pub rate_limit_policy: RateLimitPolicy,
    /// Directory for the file-backed store, None = in-memory store
    pub store_dir: Option<PathBuf>,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_PARTITION` - Store namespace (default: devnet)
    /// - `MAX_BATCH_SIZE` - Keys per upstream call (default: 100)
    /// - `BATCH_DELAY_MS` - Window extension in milliseconds (default: 0)
    /// - `VOLATILE_CAPACITY` - Volatile entry limit (default: 0, unbounded)
    /// - `VOLATILE_RETENTION_SECS` - Sweep retention (default: 0, disabled)
    /// - `SWEEP_INTERVAL_SECS` - Sweep frequency (default: 60)
    /// - `RATE_LIMIT_PER_SECOND` - Upstream tokens per second (default: unset)
    /// - `RATE_LIMIT_BURST` - Bucket size (default: same as the rate)
    /// - `RATE_LIMIT_POLICY` - `per-batch` or `per-key` (default: per-batch)
    /// - `STORE_DIR` - File store directory (default: unset, in-memory)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let rate_limit_per_second = parse_var::<u32>("RATE_LIMIT_PER_SECOND").filter(|r| *r > 0);

        Self {
            partition: env::var("CACHE_PARTITION")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.partition),
            max_batch_size: parse_var("MAX_BATCH_SIZE").unwrap_or(defaults.max_batch_size),
            batch_delay: parse_var("BATCH_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_delay),
            volatile_capacity: parse_var("VOLATILE_CAPACITY")
                .unwrap_or(defaults.volatile_capacity),
            volatile_retention: parse_var::<u64>("VOLATILE_RETENTION_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            sweep_interval: parse_var("SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            rate_limit_per_second,
            rate_limit_burst: parse_var("RATE_LIMIT_BURST")
                .or(rate_limit_per_second)
                .unwrap_or(defaults.rate_limit_burst),
            rate_limit_policy: env::var("RATE_LIMIT_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.rate_limit_policy),
            store_dir: env::var("STORE_DIR").ok().map(PathBuf::from),
        }
    }

    /// Rejects settings the loader cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(CacheError::InvalidRequest(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.partition.is_empty() {
            return Err(CacheError::InvalidRequest(
                "partition cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_volatile_capacity(mut self, capacity: usize) -> Self {
        self.volatile_capacity = capacity;
        self
    }

    /// Enables the upstream token bucket.
    pub fn with_rate_limit(mut self, per_second: u32, burst: u32, policy: RateLimitPolicy) -> Self {
        self.rate_limit_per_second = Some(per_second);
        self.rate_limit_burst = burst;
        self.rate_limit_policy = policy;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partition: "devnet".to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_delay: Duration::ZERO,
            volatile_capacity: 0,
            volatile_retention: None,
            sweep_interval: Duration::from_secs(60),
            rate_limit_per_second: None,
            rate_limit_burst: 1,
            rate_limit_policy: RateLimitPolicy::PerBatch,
            store_dir: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

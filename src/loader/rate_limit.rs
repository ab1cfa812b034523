//! Upstream rate limiting.
//!
//! A token bucket acquired by the dispatcher before each upstream call. Only
//! the dispatching task waits; cache lookups never touch the bucket.

use std::num::NonZeroU32;
use std::str::FromStr;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as Governor};
use tracing::trace;

use crate::error::{CacheError, Result};

// == Rate Limit Policy ==
/// What a single token pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitPolicy {
    /// One token per upstream call
    #[default]
    PerBatch,
    /// One token per key in the upstream call
    PerKey,
}

impl FromStr for RateLimitPolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-batch" | "batch" => Ok(RateLimitPolicy::PerBatch),
            "per-key" | "key" => Ok(RateLimitPolicy::PerKey),
            other => Err(CacheError::InvalidRequest(format!(
                "unknown rate limit policy '{}'",
                other
            ))),
        }
    }
}

// == Rate Limiter ==
pub struct RateLimiter {
    bucket: DefaultDirectRateLimiter,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    /// Creates a bucket refilling `per_second` tokens and holding `burst`.
    pub fn new(per_second: u32, burst: u32, policy: RateLimitPolicy) -> Result<Self> {
        let rate = NonZeroU32::new(per_second).ok_or_else(|| {
            CacheError::InvalidRequest("rate limit must be at least 1 per second".to_string())
        })?;
        let burst = NonZeroU32::new(burst).unwrap_or(rate);

        Ok(Self {
            bucket: Governor::direct(Quota::per_second(rate).allow_burst(burst)),
            policy,
        })
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Tokens needed to dispatch a call carrying `keys` keys.
    pub fn tokens_for(&self, keys: usize) -> usize {
        match self.policy {
            RateLimitPolicy::PerBatch => 1,
            RateLimitPolicy::PerKey => keys.max(1),
        }
    }

    // == Acquire ==
    /// Waits until the call may be dispatched.
    pub async fn acquire(&self, keys: usize) {
        let tokens = self.tokens_for(keys);
        trace!(tokens, "acquiring upstream tokens");
        for _ in 0..tokens {
            self.bucket.until_ready().await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

//! Batched Loader Module
//!
//! Coalesces concurrent key requests into batch windows and dispatches one
//! upstream `fetch_many` per window (split into chunks of `max_batch_size`).
//!
//! # Window lifecycle
//! 1. The first request that misses the volatile tier opens a window.
//! 2. The opening request yields its own task once (or sleeps for the
//!    optional `batch_delay`). Every request issued before that task is
//!    polled again joins the window, whatever runtime flavor drives it. A key
//!    already in the window is not added again; its callers share one future.
//! 3. The opener then spawns the dispatcher, which takes the window, acquires
//!    rate-limit tokens, calls the upstream per chunk, writes successful
//!    results into the volatile tier and resolves every caller.
//!
//! Requests for a key whose fetch is already dispatched join that fetch,
//! unless their max age forces a fresh one.

mod rate_limit;
mod window;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStats, ExpiringVolatileCache, MaxAge};
use crate::config::{Config, DEFAULT_MAX_BATCH_SIZE};
use crate::error::{CacheError, Result};
use crate::parser::panic_message;

pub use rate_limit::{RateLimitPolicy, RateLimiter};
pub use window::LoadResult;

use window::{BatchWindow, WindowChunk};

// == Upstream Interface ==
/// Upstream collaborator fetching many records in one call.
///
/// The returned vector must be positionally aligned with `keys`. A per-key
/// `Err` fails only that key; an `Err` for the whole call fails every key.
#[async_trait]
pub trait BatchFetch<K, V>: Send + Sync {
    async fn fetch_many(&self, keys: &[K]) -> Result<Vec<LoadResult<V>>>;
}

#[async_trait]
impl<K, V, T> BatchFetch<K, V> for Arc<T>
where
    K: Send + Sync,
    V: Send,
    T: BatchFetch<K, V> + ?Sized,
{
    async fn fetch_many(&self, keys: &[K]) -> Result<Vec<LoadResult<V>>> {
        (**self).fetch_many(keys).await
    }
}

// == Loader Options ==
#[derive(Debug)]
pub struct LoaderOptions {
    /// Maximum keys per upstream call
    pub max_batch_size: usize,
    /// Extra time a window stays open after it is created
    pub batch_delay: Duration,
    /// Volatile entry limit, 0 = unbounded
    pub volatile_capacity: usize,
    /// Token bucket in front of upstream calls
    pub rate_limiter: Option<RateLimiter>,
}

impl LoaderOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let rate_limiter = config
            .rate_limit_per_second
            .map(|rate| RateLimiter::new(rate, config.rate_limit_burst, config.rate_limit_policy))
            .transpose()?;

        Ok(Self {
            max_batch_size: config.max_batch_size,
            batch_delay: config.batch_delay,
            volatile_capacity: config.volatile_capacity,
            rate_limiter,
        })
    }
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_delay: Duration::ZERO,
            volatile_capacity: 0,
            rate_limiter: None,
        }
    }
}

type SharedLoad<V> = Shared<BoxFuture<'static, LoadResult<V>>>;

/// A key waiting on a window, open or dispatched.
struct Pending<V> {
    window_id: u64,
    future: SharedLoad<V>,
}

struct LoaderState<K, V> {
    volatile: ExpiringVolatileCache<V>,
    window: Option<BatchWindow<K, V>>,
    pending: HashMap<String, Pending<V>>,
    next_window_id: u64,
    stats: CacheStats,
}

impl<K, V> LoaderState<K, V> {
    fn is_open(&self, window_id: u64) -> bool {
        self.window.as_ref().is_some_and(|w| w.id == window_id)
    }

    /// Drops the pending entry for `cache_key` if it still belongs to
    /// `window_id`.
    fn forget(&mut self, cache_key: &str, window_id: u64) {
        if self.pending.get(cache_key).is_some_and(|p| p.window_id == window_id) {
            self.pending.remove(cache_key);
        }
    }
}

struct LoaderInner<K, V, F> {
    fetcher: F,
    options: LoaderOptions,
    state: Mutex<LoaderState<K, V>>,
}

// == Batched Loader ==
/// Request-coalescing loader owning the volatile tier.
///
/// Cloning is cheap; clones share windows and the volatile tier.
pub struct BatchedLoader<K, V, F> {
    inner: Arc<LoaderInner<K, V, F>>,
}

impl<K, V, F> Clone for BatchedLoader<K, V, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, F> BatchedLoader<K, V, F>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    F: BatchFetch<K, V> + 'static,
{
    pub fn new(fetcher: F, options: LoaderOptions) -> Self {
        let volatile = ExpiringVolatileCache::new(options.volatile_capacity);
        Self {
            inner: Arc::new(LoaderInner {
                fetcher,
                options,
                state: Mutex::new(LoaderState {
                    volatile,
                    window: None,
                    pending: HashMap::new(),
                    next_window_id: 0,
                    stats: CacheStats::new(),
                }),
            }),
        }
    }

    // == Load ==
    /// Resolves a key from the volatile tier or through a batch window.
    pub async fn load(&self, key: &K, max_age: MaxAge) -> LoadResult<V> {
        let cache_key = key.cache_key();
        let (pending, closer) = {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.volatile.get(&cache_key, max_age) {
                state.stats.record_volatile_hit();
                trace!(key = %cache_key, "volatile hit");
                return Ok(entry.value);
            }
            state.stats.record_miss();
            self.enqueue(&mut state, key, cache_key, max_age)
        };
        if let Some(closer) = closer {
            closer.hold_open().await;
        }
        pending.await
    }

    /// Loads several keys in one window. Results follow input order.
    pub async fn load_many(&self, keys: &[K], max_age: MaxAge) -> Vec<LoadResult<V>> {
        join_all(keys.iter().map(|key| self.load(key, max_age))).await
    }

    fn enqueue(
        &self,
        state: &mut LoaderState<K, V>,
        key: &K,
        cache_key: String,
        max_age: MaxAge,
    ) -> (SharedLoad<V>, Option<WindowCloser<K, V, F>>) {
        if let Some(pending) = state.pending.get(&cache_key) {
            // A key is never added twice to the open window. A dispatched
            // fetch predates this request, so a zero max age skips it.
            if state.is_open(pending.window_id) || !max_age.forces_fetch() {
                let future = pending.future.clone();
                state.stats.record_coalesced();
                trace!(key = %cache_key, window_id = pending.window_id, "joined pending fetch");
                return (future, None);
            }
        }

        let mut closer = None;
        let window = match state.window.take() {
            Some(window) => window,
            None => {
                let id = state.next_window_id;
                state.next_window_id += 1;
                closer = Some(WindowCloser {
                    inner: Arc::clone(&self.inner),
                    window_id: id,
                });
                debug!(window_id = id, "opened batch window");
                BatchWindow::new(id)
            }
        };
        let window_id = window.id;
        let window = state.window.insert(window);

        let (tx, rx) = oneshot::channel();
        let inner = Arc::downgrade(&self.inner);
        let forget_key = cache_key.clone();
        let future = rx
            .map(move |received| {
                received.unwrap_or_else(|_| {
                    forget_dropped(&inner, &forget_key, window_id);
                    Err(CacheError::Internal(
                        "batch window dropped before resolving".to_string(),
                    ))
                })
            })
            .boxed()
            .shared();

        window.push(key.clone(), cache_key.clone(), tx);
        state.pending.insert(
            cache_key,
            Pending {
                window_id,
                future: future.clone(),
            },
        );
        (future, closer)
    }

    // == Peek ==
    /// Volatile lookup only. Counts a volatile hit when it returns an entry.
    pub fn peek(&self, key: &K, max_age: MaxAge) -> Option<CacheEntry<V>> {
        let mut state = self.inner.state.lock();
        let entry = state.volatile.get(&key.cache_key(), max_age)?;
        state.stats.record_volatile_hit();
        Some(entry)
    }

    /// Installs an entry read from the durable tier, keeping its timestamp.
    ///
    /// A volatile entry filled after `entry` wins. Returns the entry left in
    /// the volatile tier.
    pub fn promote(&self, key: &K, entry: CacheEntry<V>) -> CacheEntry<V> {
        let mut state = self.inner.state.lock();
        state.stats.record_persistent_hit();
        state.volatile.set_if_newer(&key.cache_key(), entry)
    }

    // == Prime ==
    /// Seeds the volatile tier without fetching. No-op if the key is present.
    pub fn prime(&self, key: &K, value: Option<V>) -> bool {
        self.inner
            .state
            .lock()
            .volatile
            .insert_if_absent(&key.cache_key(), value)
    }

    // == Clear ==
    /// Evicts the key from the volatile tier (every age). A dispatched fetch
    /// for the key still resolves its callers but no longer fills the cache.
    pub fn clear(&self, key: &K) {
        let cache_key = key.cache_key();
        let mut state = self.inner.state.lock();
        state.volatile.delete(&cache_key);

        let dispatched = state
            .pending
            .get(&cache_key)
            .is_some_and(|p| !state.is_open(p.window_id));
        if dispatched {
            state.pending.remove(&cache_key);
        }
    }

    /// Empties the volatile tier. Windows are not cancelled.
    pub fn clear_all(&self) {
        let mut state = self.inner.state.lock();
        state.volatile.clear();

        let open = state.window.as_ref().map(|w| w.id);
        state.pending.retain(|_, p| Some(p.window_id) == open);
        debug!("volatile tier cleared");
    }

    /// Drops volatile entries older than `retention`. Returns how many.
    pub fn purge_older_than(&self, retention: Duration, now_ms: u64) -> usize {
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        self.inner
            .state
            .lock()
            .volatile
            .purge_older_than(retention_ms, now_ms)
    }

    // == Stats ==
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.evictions = state.volatile.evictions();
        stats.set_total_entries(state.volatile.len());
        stats
    }

    /// Keys waiting on an open or dispatched window.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn fetcher(&self) -> &F {
        &self.inner.fetcher
    }
}

// == Window Closer ==
/// Held by the request that opened a window. Dropping it closes the window
/// and spawns its dispatch.
struct WindowCloser<K, V, F>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    F: BatchFetch<K, V> + 'static,
{
    inner: Arc<LoaderInner<K, V, F>>,
    window_id: u64,
}

impl<K, V, F> WindowCloser<K, V, F>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    F: BatchFetch<K, V> + 'static,
{
    /// Keeps the window open until the opener's task is polled again, or for
    /// `batch_delay`. Sibling requests polled in between join the window.
    async fn hold_open(self) {
        if self.inner.options.batch_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.inner.options.batch_delay).await;
        }
    }
}

impl<K, V, F> Drop for WindowCloser<K, V, F>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    F: BatchFetch<K, V> + 'static,
{
    fn drop(&mut self) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(dispatch_window(Arc::clone(&self.inner), self.window_id));
            }
            Err(_) => warn!(window_id = self.window_id, "no runtime to dispatch batch window"),
        }
    }
}

fn forget_dropped<K, V, F>(inner: &Weak<LoaderInner<K, V, F>>, cache_key: &str, window_id: u64) {
    if let Some(inner) = inner.upgrade() {
        inner.state.lock().forget(cache_key, window_id);
    }
}

// == Dispatch ==
async fn dispatch_window<K, V, F>(inner: Arc<LoaderInner<K, V, F>>, window_id: u64)
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    F: BatchFetch<K, V> + 'static,
{
    let window = {
        let mut state = inner.state.lock();
        match state.window.take() {
            Some(window) if window.id == window_id => window,
            other => {
                state.window = other;
                return;
            }
        }
    };
    debug!(window_id, keys = window.len(), "dispatching batch window");

    let chunks = window.into_chunks(inner.options.max_batch_size);
    join_all(
        chunks
            .into_iter()
            .map(|chunk| dispatch_chunk(&inner, window_id, chunk)),
    )
    .await;
}

async fn dispatch_chunk<K, V, F>(
    inner: &LoaderInner<K, V, F>,
    window_id: u64,
    chunk: WindowChunk<K, V>,
) where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    F: BatchFetch<K, V> + 'static,
{
    let WindowChunk {
        keys,
        cache_keys,
        senders,
    } = chunk;
    let count = keys.len();

    if let Some(limiter) = &inner.options.rate_limiter {
        limiter.acquire(count).await;
    }
    inner.state.lock().stats.record_upstream_call(count);

    let fetched = AssertUnwindSafe(inner.fetcher.fetch_many(&keys))
        .catch_unwind()
        .await;
    let results = match fetched {
        Ok(Ok(results)) if results.len() == count => results,
        Ok(Ok(results)) => {
            let err = CacheError::Upstream(format!(
                "upstream returned {} results for {} keys",
                results.len(),
                count
            ));
            warn!(window_id, keys = count, error = %err, "misaligned upstream response");
            repeat_error(err, count)
        }
        Ok(Err(err)) => {
            warn!(window_id, keys = count, error = %err, "upstream batch failed");
            repeat_error(err, count)
        }
        Err(payload) => {
            let err = CacheError::Upstream(format!(
                "upstream fetch panicked: {}",
                panic_message(payload.as_ref())
            ));
            warn!(window_id, keys = count, error = %err, "upstream batch panicked");
            repeat_error(err, count)
        }
    };

    let mut state = inner.state.lock();
    for ((cache_key, sender), result) in cache_keys.into_iter().zip(senders).zip(results) {
        let current = state
            .pending
            .get(&cache_key)
            .is_some_and(|p| p.window_id == window_id);
        if current {
            state.pending.remove(&cache_key);
            if let Ok(value) = &result {
                state.volatile.set(&cache_key, value.clone());
            }
        }
        // every caller may have gone away
        let _ = sender.send(result);
    }
}

fn repeat_error<V>(err: CacheError, count: usize) -> Vec<LoadResult<V>> {
    std::iter::repeat(err).take(count).map(Err).collect()
}

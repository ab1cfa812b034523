//! Record Cache Module
//!
//! The externally facing cache. A load walks the tiers in order:
//!
//! 1. volatile tier (no I/O)
//! 2. persistent store, promoting fresh rows into the volatile tier
//! 3. the batched loader, which coalesces the request with its window
//!
//! Upstream results are written to the persistent store before any caller
//! observes them and to the volatile tier as the window resolves. Errors are
//! never cached in either tier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{current_timestamp_ms, CacheKey, CacheStats, MaxAge};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::loader::{BatchFetch, BatchedLoader, LoadResult, LoaderOptions};
use crate::parser::{catch_as_value, NoParsers, ParserTable};
use crate::store::{FileStoreProvider, MemoryBackend, PersistentStore, StoreProvider};
use crate::tasks::spawn_sweep_task;

// == Clear Log ==
/// Clears made while upstream fetches are in flight.
///
/// A fetch notes the generation when it starts; before writing a key it
/// checks whether that key (or the whole partition) was cleared since.
#[derive(Debug, Default)]
struct ClearLog {
    generation: u64,
    inflight: usize,
    keys: HashMap<String, u64>,
    all: u64,
}

impl ClearLog {
    fn begin(&mut self) -> u64 {
        self.inflight += 1;
        self.generation
    }

    fn end(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
        if self.inflight == 0 {
            self.keys.clear();
        }
    }

    fn record(&mut self, cache_key: Option<&str>) {
        self.generation += 1;
        match cache_key {
            Some(key) if self.inflight > 0 => {
                self.keys.insert(key.to_string(), self.generation);
            }
            Some(_) => {}
            None => self.all = self.generation,
        }
    }

    fn cleared_since(&self, cache_key: &str, generation: u64) -> bool {
        self.all > generation || self.keys.get(cache_key).is_some_and(|g| *g > generation)
    }
}

/// Marks one fetch in flight for as long as it lives.
struct InflightFetch<'a> {
    log: &'a Mutex<ClearLog>,
    generation: u64,
}

impl<'a> InflightFetch<'a> {
    fn begin(log: &'a Mutex<ClearLog>) -> Self {
        let generation = log.lock().begin();
        Self { log, generation }
    }

    fn cleared(&self, cache_key: &str) -> bool {
        self.log.lock().cleared_since(cache_key, self.generation)
    }
}

impl Drop for InflightFetch<'_> {
    fn drop(&mut self) {
        self.log.lock().end();
    }
}

// == Store Handle ==
/// Lazily opened, memoized store for one partition.
pub struct StoreHandle<V> {
    partition: String,
    provider: Box<dyn StoreProvider<V>>,
    store: OnceCell<Arc<dyn PersistentStore<V>>>,
    clears: Mutex<ClearLog>,
}

impl<V> StoreHandle<V> {
    fn new(partition: String, provider: Box<dyn StoreProvider<V>>) -> Self {
        Self {
            partition,
            provider,
            store: OnceCell::new(),
            clears: Mutex::new(ClearLog::default()),
        }
    }

    /// Opens the store on first use; later calls return the same handle.
    pub async fn get(&self) -> Result<Arc<dyn PersistentStore<V>>> {
        let store = self
            .store
            .get_or_try_init(|| async {
                info!(partition = %self.partition, "opening persistent store");
                self.provider.open(&self.partition).await
            })
            .await?;
        Ok(Arc::clone(store))
    }
}

// == Write-Through Fetcher ==
/// Upstream wrapper persisting every successful result before the window
/// resolves. A failed write turns that key's result into the store error.
/// Keys cleared while the fetch was in flight are not written.
pub struct WriteThrough<K, V> {
    upstream: Arc<dyn BatchFetch<K, V>>,
    store: Arc<StoreHandle<V>>,
}

#[async_trait]
impl<K, V> BatchFetch<K, V> for WriteThrough<K, V>
where
    K: CacheKey,
    V: Serialize + Send + Sync + 'static,
{
    async fn fetch_many(&self, keys: &[K]) -> Result<Vec<LoadResult<V>>> {
        let inflight = InflightFetch::begin(&self.store.clears);
        let results = self.upstream.fetch_many(keys).await?;
        if results.len() != keys.len() {
            // the loader rejects misaligned responses
            return Ok(results);
        }

        let store = self.store.get().await?;
        let timestamp_ms = current_timestamp_ms();
        let writes = keys.iter().zip(&results).map(|(key, result)| {
            let store = &store;
            let inflight = &inflight;
            async move {
                let cache_key = key.cache_key();
                match result {
                    Ok(_) if inflight.cleared(&cache_key) => {
                        debug!(key = %cache_key, "cleared during fetch, not persisted");
                        Ok(())
                    }
                    Ok(value) => store.put(&cache_key, value.as_ref(), timestamp_ms).await,
                    Err(_) => Ok(()),
                }
            }
        });
        let writes = join_all(writes).await;

        Ok(results
            .into_iter()
            .zip(writes)
            .map(|(result, write)| match write {
                Ok(()) => result,
                Err(err) => {
                    warn!(error = %err, "failed to persist fetched record");
                    Err(err)
                }
            })
            .collect())
    }
}

// == Loaded ==
/// One entry of [`RecordCache::load_many_parsed`].
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<V, T> {
    /// Raw record, requested without a parser
    Raw(V),
    /// Output of the requested parser
    Parsed(T),
}

// == Record Cache ==
/// Two-tier cache over a batched upstream, with optional tagged parsers.
pub struct RecordCache<K, V, P = NoParsers> {
    store: Arc<StoreHandle<V>>,
    loader: BatchedLoader<K, V, WriteThrough<K, V>>,
    parsers: P,
}

impl<K, V, P> RecordCache<K, V, P>
where
    K: CacheKey,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    P: ParserTable<K, V>,
{
    // == Constructor ==
    /// Creates a cache over `upstream`, persisting into the store `provider`
    /// opens for the configured partition.
    pub fn new<S>(
        config: &Config,
        upstream: Arc<dyn BatchFetch<K, V>>,
        provider: S,
        parsers: P,
    ) -> Result<Self>
    where
        S: StoreProvider<V> + 'static,
    {
        let options = LoaderOptions::from_config(config)?;
        let store = Arc::new(StoreHandle::new(
            config.partition.clone(),
            Box::new(provider),
        ));
        let fetcher = WriteThrough {
            upstream,
            store: Arc::clone(&store),
        };

        Ok(Self {
            store,
            loader: BatchedLoader::new(fetcher, options),
            parsers,
        })
    }

    /// Creates a cache whose store is chosen by the configuration: a file
    /// store under `store_dir` when set, an in-memory store otherwise.
    pub fn from_config(
        config: &Config,
        upstream: Arc<dyn BatchFetch<K, V>>,
        parsers: P,
    ) -> Result<Self> {
        match &config.store_dir {
            Some(dir) => Self::new(config, upstream, FileStoreProvider::new(dir), parsers),
            None => Self::new(config, upstream, MemoryBackend::new(), parsers),
        }
    }

    pub fn partition(&self) -> &str {
        &self.store.partition
    }

    // == Load ==
    /// Loads the raw record for `key`.
    ///
    /// `Ok(None)` means the record is confirmed absent upstream.
    pub async fn load(&self, key: &K, max_age: MaxAge) -> Result<Option<V>> {
        if let Some(entry) = self.loader.peek(key, max_age) {
            trace!(key = %key.cache_key(), "served from volatile tier");
            return Ok(entry.value);
        }

        let cache_key = key.cache_key();
        let store = self.store.get().await?;
        if let Some(entry) = store.get(&cache_key).await? {
            if entry.is_fresh(max_age, current_timestamp_ms()) {
                debug!(key = %cache_key, age_ms = entry.age_ms(current_timestamp_ms()), "promoted from persistent store");
                return Ok(self.loader.promote(key, entry).value);
            }
        }

        self.loader.load(key, max_age).await
    }

    /// Loads `key` and applies the parser registered under `tag`.
    ///
    /// A confirmed-absent record is `Ok(None)` and the parser is not called.
    /// A parser error or panic is returned as `CacheError::Parse`; the raw
    /// record stays cached.
    pub async fn load_parsed(&self, key: &K, tag: P::Tag, max_age: MaxAge) -> Result<Option<P::Output>> {
        let record = self.load(key, max_age).await?;
        record
            .map(|record| catch_as_value(|| self.parsers.parse(tag, key, &record)))
            .transpose()
    }

    /// Loads several keys in one batch window. Results follow input order.
    pub async fn load_many(&self, keys: &[K], max_age: MaxAge) -> Vec<Result<Option<V>>> {
        join_all(keys.iter().map(|key| self.load(key, max_age))).await
    }

    /// Loads several keys in one batch window, each with its own parser (or
    /// none for the raw record). A failing parser only fails its own entry.
    pub async fn load_many_parsed(
        &self,
        requests: &[(K, Option<P::Tag>)],
        max_age: MaxAge,
    ) -> Vec<Result<Option<Loaded<V, P::Output>>>> {
        join_all(requests.iter().map(|(key, tag)| async move {
            match tag {
                Some(tag) => Ok(self.load_parsed(key, *tag, max_age).await?.map(Loaded::Parsed)),
                None => Ok(self.load(key, max_age).await?.map(Loaded::Raw)),
            }
        }))
        .await
    }

    // == Clear ==
    /// Removes the key from the persistent store, then the volatile tier.
    pub async fn clear(&self, key: &K) -> Result<()> {
        let cache_key = key.cache_key();
        let store = self.store.get().await?;
        self.store.clears.lock().record(Some(&cache_key));
        store.delete(&cache_key).await?;
        self.loader.clear(key);
        debug!(key = %cache_key, "cleared record");
        Ok(())
    }

    /// Empties the persistent store, then the volatile tier.
    pub async fn clear_all(&self) -> Result<()> {
        let store = self.store.get().await?;
        self.store.clears.lock().record(None);
        store.clear().await?;
        self.loader.clear_all();
        info!(partition = %self.partition(), "cleared all records");
        Ok(())
    }

    // == Store ==
    /// The partition's persistent store, opened on first call.
    pub async fn store(&self) -> Result<Arc<dyn PersistentStore<V>>> {
        self.store.get().await
    }

    pub fn loader(&self) -> &BatchedLoader<K, V, WriteThrough<K, V>> {
        &self.loader
    }

    /// Seeds the volatile tier without fetching. No-op if already present.
    pub fn prime(&self, key: &K, value: Option<V>) -> bool {
        self.loader.prime(key, value)
    }

    pub fn stats(&self) -> CacheStats {
        self.loader.stats()
    }

    /// Starts the background sweep dropping volatile entries older than
    /// `retention`.
    pub fn spawn_sweep_task(&self, interval: Duration, retention: Duration) -> JoinHandle<()> {
        spawn_sweep_task(self.loader.clone(), interval, retention)
    }

    /// Starts the sweep if the configuration sets a retention.
    pub fn spawn_configured_sweep(&self, config: &Config) -> Result<Option<JoinHandle<()>>> {
        match config.volatile_retention {
            Some(retention) if config.sweep_interval.is_zero() => Err(CacheError::InvalidRequest(
                format!("sweep interval must be non-zero (retention {:?})", retention),
            )),
            Some(retention) => Ok(Some(self.spawn_sweep_task(config.sweep_interval, retention))),
            None => Ok(None),
        }
    }
}

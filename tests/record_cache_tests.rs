//! Integration Tests for RecordCache
//!
//! Drives the full load path (volatile tier, persistent store, batched
//! upstream) through the public API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use record_cache::cache::current_timestamp_ms;
use record_cache::store::{FileStoreProvider, MemoryBackend, MemoryStore};
use record_cache::{
    BatchFetch, CacheError, Config, LoadResult, Loaded, MaxAge, ParseError, ParserTable, PersistentStore,
    RecordCache, Result, StoreProvider,
};
use tracing_subscriber::EnvFilter;

// == Helper Types ==

/// Upstream double. "missing" is absent, "broken" fails, anything else
/// resolves to `value:<key>`. Every call's keys are recorded.
#[derive(Default)]
struct RecordingUpstream {
    calls: Mutex<Vec<Vec<String>>>,
    delay: Duration,
}

impl RecordingUpstream {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BatchFetch<String, String> for RecordingUpstream {
    async fn fetch_many(&self, keys: &[String]) -> Result<Vec<LoadResult<String>>> {
        self.calls.lock().unwrap().push(keys.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(keys
            .iter()
            .map(|key| match key.as_str() {
                "missing" => Ok(None),
                "broken" => Err(CacheError::Record(format!("cannot decode {}", key))),
                other => Ok(Some(format!("value:{}", other))),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
enum View {
    Upper,
    Length,
    Rejects,
    Panics,
}

struct Views;

impl ParserTable<String, String> for Views {
    type Tag = View;
    type Output = String;

    fn parse(&self, tag: View, _key: &String, record: &String) -> std::result::Result<String, ParseError> {
        match tag {
            View::Upper => Ok(record.to_uppercase()),
            View::Length => Ok(record.len().to_string()),
            View::Rejects => Err(ParseError::new("unexpected layout")),
            View::Panics => panic!("parser bug"),
        }
    }
}

/// Store whose writes always fail.
struct ReadOnlyProvider(MemoryBackend);

struct ReadOnlyStore(MemoryStore<String>);

#[async_trait]
impl StoreProvider<String> for ReadOnlyProvider {
    async fn open(&self, partition: &str) -> Result<Arc<dyn PersistentStore<String>>> {
        Ok(Arc::new(ReadOnlyStore(self.0.store(partition))))
    }
}

#[async_trait]
impl PersistentStore<String> for ReadOnlyStore {
    fn partition(&self) -> &str {
        self.0.partition()
    }

    async fn get(&self, key: &str) -> Result<Option<record_cache::CacheEntry<String>>> {
        self.0.get(key).await
    }

    async fn put(&self, _key: &str, _value: Option<&String>, _timestamp_ms: u64) -> Result<()> {
        Err(CacheError::Store("store is read-only".to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.0.delete(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.0.clear().await
    }
}

// == Helper Functions ==

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn cache_over(
    upstream: &Arc<RecordingUpstream>,
    backend: &MemoryBackend,
) -> RecordCache<String, String, Views> {
    init_tracing();
    let upstream: Arc<dyn BatchFetch<String, String>> = upstream.clone();
    RecordCache::new(&Config::default(), upstream, backend.clone(), Views).unwrap()
}

fn key(s: &str) -> String {
    s.to_string()
}

async fn seed(cache: &RecordCache<String, String, Views>, k: &str, age: Duration) {
    let timestamp_ms = current_timestamp_ms() - age.as_millis() as u64;
    cache
        .store()
        .await
        .unwrap()
        .put(k, Some(&format!("stored:{}", k)), timestamp_ms)
        .await
        .unwrap();
}

// == Batching ==

#[tokio::test]
async fn test_concurrent_loads_of_one_key_fetch_once() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    let (key_a, key_b) = (key("k"), key("k"));
    let (a, b) = tokio::join!(
        cache.load(&key_a, MaxAge::Unbounded),
        cache.load(&key_b, MaxAge::Unbounded),
    );

    assert_eq!(a.unwrap().as_deref(), Some("value:k"));
    assert_eq!(b.unwrap().as_deref(), Some("value:k"));
    assert_eq!(upstream.calls(), vec![vec![key("k")]]);
}

#[tokio::test]
async fn test_distinct_keys_share_one_call() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    let results = cache
        .load_many(&[key("a"), key("b"), key("c")], MaxAge::Unbounded)
        .await;

    let values: Vec<_> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
    assert_eq!(values, vec!["value:a", "value:b", "value:c"]);
    assert_eq!(upstream.calls(), vec![vec![key("a"), key("b"), key("c")]]);
}

#[tokio::test]
async fn test_partial_failure_is_isolated() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    let results = cache
        .load_many(&[key("k1"), key("broken"), key("k3")], MaxAge::Unbounded)
        .await;

    assert_eq!(results[0].as_ref().unwrap().as_deref(), Some("value:k1"));
    assert!(matches!(results[1], Err(CacheError::Record(_))));
    assert_eq!(results[2].as_ref().unwrap().as_deref(), Some("value:k3"));

    // successes are served from cache, the failure is retried
    cache.load(&key("k1"), MaxAge::Unbounded).await.unwrap();
    let _ = cache.load(&key("broken"), MaxAge::Unbounded).await;
    assert_eq!(upstream.calls(), vec![
        vec![key("k1"), key("broken"), key("k3")],
        vec![key("broken")],
    ]);
}

// == Freshness ==

#[tokio::test]
async fn test_tiers_routed_by_max_age() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());
    seed(&cache, "k5", Duration::from_secs(5)).await;
    seed(&cache, "k30", Duration::from_secs(30)).await;
    seed(&cache, "k70", Duration::from_secs(70)).await;

    let max_age = MaxAge::from_secs(10);
    let (key5, key30, key70) = (key("k5"), key("k30"), key("k70"));
    let (k5, k30, k70) = tokio::join!(
        cache.load(&key5, max_age),
        cache.load(&key30, max_age),
        cache.load(&key70, max_age),
    );

    assert_eq!(k5.unwrap().as_deref(), Some("stored:k5"));
    assert_eq!(k30.unwrap().as_deref(), Some("value:k30"));
    assert_eq!(k70.unwrap().as_deref(), Some("value:k70"));
    assert_eq!(upstream.calls(), vec![vec![key("k30"), key("k70")]]);
    assert_eq!(cache.stats().persistent_hits, 1);
}

#[tokio::test]
async fn test_promoted_entry_keeps_stored_timestamp() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());
    seed(&cache, "k", Duration::from_secs(20)).await;

    // promoted from the store
    let value = cache.load(&key("k"), MaxAge::from_secs(60)).await.unwrap();
    assert_eq!(value.as_deref(), Some("stored:k"));
    assert_eq!(upstream.call_count(), 0);

    // still 20s old, so a 10s bound refetches
    let value = cache.load(&key("k"), MaxAge::from_secs(10)).await.unwrap();
    assert_eq!(value.as_deref(), Some("value:k"));
    assert_eq!(upstream.call_count(), 1);
}

#[tokio::test]
async fn test_unbounded_accepts_any_age() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());
    seed(&cache, "old", Duration::from_secs(365 * 24 * 3600)).await;

    let value = cache.load(&key("old"), MaxAge::Unbounded).await.unwrap();

    assert_eq!(value.as_deref(), Some("stored:old"));
    assert_eq!(upstream.call_count(), 0);
}

#[tokio::test]
async fn test_zero_max_age_always_fetches() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    cache.load(&key("k"), MaxAge::Unbounded).await.unwrap();
    cache.load(&key("k"), MaxAge::FRESH).await.unwrap();
    cache.load(&key("k"), MaxAge::FRESH).await.unwrap();

    assert_eq!(upstream.call_count(), 3);
}

#[tokio::test]
async fn test_max_age_within_bound_is_served_from_cache() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    cache.load(&key("k"), MaxAge::Unbounded).await.unwrap();
    cache.load(&key("k"), MaxAge::from_secs(5)).await.unwrap();

    assert_eq!(upstream.call_count(), 1);
    assert_eq!(cache.stats().volatile_hits, 1);
}

// == Absent Records ==

#[tokio::test]
async fn test_absent_record_is_cached_until_cleared() {
    let upstream = Arc::new(RecordingUpstream::default());
    let backend = MemoryBackend::new();
    let cache = cache_over(&upstream, &backend);

    assert_eq!(cache.load(&key("missing"), MaxAge::Unbounded).await.unwrap(), None);
    assert_eq!(cache.load(&key("missing"), MaxAge::Unbounded).await.unwrap(), None);
    assert_eq!(upstream.call_count(), 1);

    let row = backend.row("devnet", "missing").unwrap();
    assert_eq!(row.serialized_value, "null");

    cache.clear(&key("missing")).await.unwrap();
    cache.load(&key("missing"), MaxAge::Unbounded).await.unwrap();
    assert_eq!(upstream.call_count(), 2);
}

// == Clear ==

#[tokio::test]
async fn test_clear_removes_both_tiers() {
    let upstream = Arc::new(RecordingUpstream::default());
    let backend = MemoryBackend::new();
    let cache = cache_over(&upstream, &backend);

    cache.load(&key("k"), MaxAge::Unbounded).await.unwrap();
    assert!(backend.row("devnet", "k").is_some());

    cache.clear(&key("k")).await.unwrap();

    assert!(backend.row("devnet", "k").is_none());
    assert!(cache.loader().peek(&key("k"), MaxAge::Unbounded).is_none());

    cache.load(&key("k"), MaxAge::Unbounded).await.unwrap();
    assert_eq!(upstream.call_count(), 2);
}

#[tokio::test]
async fn test_clear_all_empties_partition() {
    let upstream = Arc::new(RecordingUpstream::default());
    let backend = MemoryBackend::new();
    let cache = cache_over(&upstream, &backend);

    cache.load_many(&[key("a"), key("b")], MaxAge::Unbounded).await;
    assert_eq!(backend.row_count("devnet"), 2);

    cache.clear_all().await.unwrap();

    assert_eq!(backend.row_count("devnet"), 0);
    assert_eq!(cache.stats().total_entries, 0);

    cache.load_many(&[key("a"), key("b")], MaxAge::Unbounded).await;
    assert_eq!(upstream.call_count(), 2);
}

#[tokio::test]
async fn test_clear_during_fetch_skips_persistent_write() {
    let upstream = Arc::new(RecordingUpstream::slow(Duration::from_millis(50)));
    let backend = MemoryBackend::new();
    let cache = Arc::new(cache_over(&upstream, &backend));

    let inflight = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.load(&key("k"), MaxAge::Unbounded).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.clear(&key("k")).await.unwrap();

    // the caller that was waiting still gets its answer
    assert_eq!(inflight.await.unwrap().unwrap().as_deref(), Some("value:k"));
    assert!(backend.row("devnet", "k").is_none());

    cache.load(&key("k"), MaxAge::Unbounded).await.unwrap();
    assert_eq!(upstream.call_count(), 2);
    assert!(backend.row("devnet", "k").is_some());
}

#[tokio::test]
async fn test_clear_all_during_fetch_skips_persistent_write() {
    let upstream = Arc::new(RecordingUpstream::slow(Duration::from_millis(50)));
    let backend = MemoryBackend::new();
    let cache = Arc::new(cache_over(&upstream, &backend));

    let inflight = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.load_many(&[key("a"), key("b")], MaxAge::Unbounded).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.clear_all().await.unwrap();

    assert!(inflight.await.unwrap().iter().all(|r| r.is_ok()));
    assert_eq!(backend.row_count("devnet"), 0);
}

// == Parsers ==

#[tokio::test]
async fn test_parsed_views_share_one_fetch() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    let (key_upper, key_length) = (key("k"), key("k"));
    let (upper, length) = tokio::join!(
        cache.load_parsed(&key_upper, View::Upper, MaxAge::Unbounded),
        cache.load_parsed(&key_length, View::Length, MaxAge::Unbounded),
    );

    assert_eq!(upper.unwrap().as_deref(), Some("VALUE:K"));
    assert_eq!(length.unwrap().as_deref(), Some("7"));
    assert_eq!(upstream.call_count(), 1);
}

#[tokio::test]
async fn test_parser_failure_is_isolated() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    let rejected = cache
        .load_parsed(&key("k"), View::Rejects, MaxAge::Unbounded)
        .await;
    assert_eq!(rejected, Err(CacheError::Parse("unexpected layout".to_string())));

    let panicked = cache
        .load_parsed(&key("k"), View::Panics, MaxAge::Unbounded)
        .await;
    assert!(matches!(panicked, Err(CacheError::Parse(msg)) if msg.contains("parser bug")));

    // the raw record stays cached
    let raw = cache.load(&key("k"), MaxAge::Unbounded).await.unwrap();
    assert_eq!(raw.as_deref(), Some("value:k"));
    assert_eq!(upstream.call_count(), 1);
}

#[tokio::test]
async fn test_mixed_parsed_batch_isolates_panicking_parser() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    let requests = [
        (key("a"), Some(View::Upper)),
        (key("b"), Some(View::Length)),
        (key("c"), None),
        (key("d"), Some(View::Panics)),
        (key("missing"), Some(View::Upper)),
    ];
    let results = cache.load_many_parsed(&requests, MaxAge::Unbounded).await;

    assert_eq!(results[0], Ok(Some(Loaded::Parsed("VALUE:A".to_string()))));
    assert_eq!(results[1], Ok(Some(Loaded::Parsed("7".to_string()))));
    assert_eq!(results[2], Ok(Some(Loaded::Raw("value:c".to_string()))));
    assert!(matches!(&results[3], Err(CacheError::Parse(msg)) if msg.contains("parser bug")));
    assert_eq!(results[4], Ok(None));
    assert_eq!(upstream.calls(), vec![vec![key("a"), key("b"), key("c"), key("d"), key("missing")]]);
}

#[tokio::test]
async fn test_absent_record_skips_parser() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    let parsed = cache
        .load_parsed(&key("missing"), View::Panics, MaxAge::Unbounded)
        .await
        .unwrap();

    assert_eq!(parsed, None);
}

// == Persistence ==

#[tokio::test]
async fn test_result_persisted_before_load_returns() {
    let upstream = Arc::new(RecordingUpstream::default());
    let backend = MemoryBackend::new();
    let cache = cache_over(&upstream, &backend);

    cache.load(&key("k"), MaxAge::Unbounded).await.unwrap();

    let row = backend.row("devnet", "k").unwrap();
    assert_eq!(row.serialized_value, "\"value:k\"");
    assert!(row.timestamp_ms <= current_timestamp_ms());
}

#[tokio::test]
async fn test_store_opened_once() {
    let upstream = Arc::new(RecordingUpstream::default());
    let backend = MemoryBackend::new();
    let cache = cache_over(&upstream, &backend);

    cache.load_many(&[key("a"), key("b")], MaxAge::Unbounded).await;
    cache.load(&key("c"), MaxAge::FRESH).await.unwrap();
    cache.clear(&key("a")).await.unwrap();
    let first = cache.store().await.unwrap();
    let second = cache.store().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(backend.opens(), 1);
}

#[tokio::test]
async fn test_store_write_failure_rejects_key() {
    init_tracing();
    let upstream = Arc::new(RecordingUpstream::default());
    let dyn_upstream: Arc<dyn BatchFetch<String, String>> = upstream.clone();
    let cache = RecordCache::new(
        &Config::default(),
        dyn_upstream,
        ReadOnlyProvider(MemoryBackend::new()),
        Views,
    )
    .unwrap();

    let result = cache.load(&key("k"), MaxAge::Unbounded).await;
    assert!(matches!(result, Err(CacheError::Store(_))));

    // nothing was cached, so the next load fetches again
    let _ = cache.load(&key("k"), MaxAge::Unbounded).await;
    assert_eq!(upstream.call_count(), 2);
}

#[tokio::test]
async fn test_store_survives_restart() {
    let backend = MemoryBackend::new();

    let first_upstream = Arc::new(RecordingUpstream::default());
    let first = cache_over(&first_upstream, &backend);
    first.load(&key("k"), MaxAge::Unbounded).await.unwrap();
    drop(first);

    let second_upstream = Arc::new(RecordingUpstream::default());
    let second = cache_over(&second_upstream, &backend);
    let value = second.load(&key("k"), MaxAge::from_secs(60)).await.unwrap();

    assert_eq!(value.as_deref(), Some("value:k"));
    assert_eq!(second_upstream.call_count(), 0);
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let first_upstream = Arc::new(RecordingUpstream::default());
    let upstream: Arc<dyn BatchFetch<String, String>> = first_upstream.clone();
    let first = RecordCache::new(
        &Config::default(),
        upstream,
        FileStoreProvider::new(dir.path()),
        Views,
    )
    .unwrap();
    first.load_many(&[key("a"), key("missing")], MaxAge::Unbounded).await;
    drop(first);

    let second_upstream = Arc::new(RecordingUpstream::default());
    let upstream: Arc<dyn BatchFetch<String, String>> = second_upstream.clone();
    let second = RecordCache::new(
        &Config::default(),
        upstream,
        FileStoreProvider::new(dir.path()),
        Views,
    )
    .unwrap();

    assert_eq!(
        second.load(&key("a"), MaxAge::Unbounded).await.unwrap().as_deref(),
        Some("value:a")
    );
    assert_eq!(second.load(&key("missing"), MaxAge::Unbounded).await.unwrap(), None);
    assert_eq!(second_upstream.call_count(), 0);
}

#[tokio::test]
async fn test_partitions_are_isolated() {
    let backend = MemoryBackend::new();
    let upstream = Arc::new(RecordingUpstream::default());
    let devnet = cache_over(&upstream, &backend);
    devnet.load(&key("k"), MaxAge::Unbounded).await.unwrap();

    let mainnet_upstream = Arc::new(RecordingUpstream::default());
    let dyn_upstream: Arc<dyn BatchFetch<String, String>> = mainnet_upstream.clone();
    let mainnet = RecordCache::new(
        &Config::default().with_partition("mainnet"),
        dyn_upstream,
        backend.clone(),
        Views,
    )
    .unwrap();
    mainnet.load(&key("k"), MaxAge::Unbounded).await.unwrap();

    assert_eq!(mainnet_upstream.call_count(), 1);
    assert_eq!(mainnet.partition(), "mainnet");
}

// == Priming ==

#[tokio::test]
async fn test_primed_value_served_without_fetch() {
    let upstream = Arc::new(RecordingUpstream::default());
    let cache = cache_over(&upstream, &MemoryBackend::new());

    assert!(cache.prime(&key("k"), Some("seeded".to_string())));
    assert!(!cache.prime(&key("k"), Some("other".to_string())));

    let value = cache.load(&key("k"), MaxAge::Unbounded).await.unwrap();
    assert_eq!(value.as_deref(), Some("seeded"));
    assert_eq!(upstream.call_count(), 0);
}

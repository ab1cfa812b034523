//! Volatile Sweep Task
//!
//! Freshness is decided per request, so stale volatile entries are never
//! served. The sweep only bounds memory by dropping entries no caller is
//! expected to accept any more.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{current_timestamp_ms, CacheKey};
use crate::loader::{BatchFetch, BatchedLoader};

/// Spawns a task that every `interval` purges volatile entries older than
/// `retention`.
///
/// The returned handle can be aborted on shutdown.
///
/// # Example
/// ```ignore
/// let handle = spawn_sweep_task(loader.clone(), Duration::from_secs(60), Duration::from_secs(600));
/// // Later, during shutdown:
/// handle.abort();
/// ```
pub fn spawn_sweep_task<K, V, F>(
    loader: BatchedLoader<K, V, F>,
    interval: Duration,
    retention: Duration,
) -> JoinHandle<()>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    F: BatchFetch<K, V> + 'static,
{
    tokio::spawn(async move {
        info!(?interval, ?retention, "starting volatile sweep task");

        loop {
            tokio::time::sleep(interval).await;

            let removed = loader.purge_older_than(retention, current_timestamp_ms());
            if removed > 0 {
                info!("volatile sweep: removed {} entries", removed);
            } else {
                debug!("volatile sweep: nothing to remove");
            }
        }
    })
}

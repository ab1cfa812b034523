//! In-memory reference store.
//!
//! Rows are serialized exactly as a durable engine would store them, so the
//! persisted-layout contract is exercised without touching disk. Stores opened
//! from the same [`MemoryBackend`] share rows, which lets tests simulate a
//! process restart by building a new cache over the old backend.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::cache::CacheEntry;
use crate::error::Result;
use crate::store::{PersistentStore, StoreProvider, StoredRow};

type Partitions = HashMap<String, HashMap<String, StoredRow>>;

// == Memory Backend ==
/// Shared row storage for every partition.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    partitions: Arc<Mutex<Partitions>>,
    opens: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (creating if needed) the store for a partition.
    pub fn store<V>(&self, partition: &str) -> MemoryStore<V> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        self.partitions
            .lock()
            .entry(partition.to_string())
            .or_default();
        debug!(partition, "opened in-memory store");

        MemoryStore {
            partition: partition.to_string(),
            partitions: Arc::clone(&self.partitions),
            _record: PhantomData,
        }
    }

    /// Number of times a store has been opened from this backend.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    /// Raw row, for inspecting the persisted layout.
    pub fn row(&self, partition: &str, key: &str) -> Option<StoredRow> {
        self.partitions
            .lock()
            .get(partition)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    pub fn row_count(&self, partition: &str) -> usize {
        self.partitions
            .lock()
            .get(partition)
            .map_or(0, |rows| rows.len())
    }
}

#[async_trait]
impl<V> StoreProvider<V> for MemoryBackend
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn open(&self, partition: &str) -> Result<Arc<dyn PersistentStore<V>>> {
        Ok(Arc::new(self.store::<V>(partition)))
    }
}

// == Memory Store ==
/// One partition of a [`MemoryBackend`].
pub struct MemoryStore<V> {
    partition: String,
    partitions: Arc<Mutex<Partitions>>,
    _record: PhantomData<fn() -> V>,
}

impl<V> MemoryStore<V> {
    fn with_rows<T>(&self, f: impl FnOnce(&mut HashMap<String, StoredRow>) -> T) -> T {
        let mut partitions = self.partitions.lock();
        f(partitions.entry(self.partition.clone()).or_default())
    }
}

#[async_trait]
impl<V> PersistentStore<V> for MemoryStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn partition(&self) -> &str {
        &self.partition
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        let row = self.with_rows(|rows| rows.get(key).cloned());
        row.map(|row| row.decode()).transpose()
    }

    async fn put(&self, key: &str, value: Option<&V>, timestamp_ms: u64) -> Result<()> {
        let row = StoredRow::encode(key, value, timestamp_ms)?;
        self.with_rows(|rows| rows.insert(key.to_string(), row));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_rows(|rows| rows.remove(key));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.with_rows(|rows| rows.clear());
        Ok(())
    }
}

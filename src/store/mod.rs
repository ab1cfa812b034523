//! Persistent Store Module
//!
//! The durable tier. Stores are namespaced by a logical partition (for example
//! the network the records come from) and hold one row per canonical key:
//! `{ key, serialized_value, timestamp_ms }`.
//!
//! # Implementations
//! - [`MemoryStore`]: rows kept in a shared [`MemoryBackend`], reopenable
//! - [`FileStore`]: one JSON file per partition, replaced atomically

mod file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::error::{CacheError, Result};

pub use file::{FileStore, FileStoreProvider};
pub use memory::{MemoryBackend, MemoryStore};

// == Persistent Store ==
/// Durable key -> (record, timestamp) store for one partition.
///
/// `put` followed by `get` for the same key must return exactly the written
/// value and timestamp. A stored `None` is a confirmed-absent record and is
/// returned as `Some(entry)` with `entry.value == None`; `Ok(None)` means the
/// key was never stored.
#[async_trait]
pub trait PersistentStore<V>: Send + Sync {
    /// Partition this store is namespaced by.
    fn partition(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>>;

    async fn put(&self, key: &str, value: Option<&V>, timestamp_ms: u64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

// == Store Provider ==
/// Opens the store for a partition. Called once per cache, lazily.
#[async_trait]
pub trait StoreProvider<V>: Send + Sync {
    async fn open(&self, partition: &str) -> Result<Arc<dyn PersistentStore<V>>>;
}

// == Stored Row ==
/// Persisted layout of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    /// Canonical key string
    pub key: String,
    /// JSON encoding of the record, `null` when confirmed absent
    pub serialized_value: String,
    /// Fill timestamp (Unix milliseconds)
    pub timestamp_ms: u64,
}

impl StoredRow {
    pub fn encode<V: Serialize>(key: &str, value: Option<&V>, timestamp_ms: u64) -> Result<Self> {
        Ok(Self {
            key: key.to_string(),
            serialized_value: serde_json::to_string(&value)?,
            timestamp_ms,
        })
    }

    pub fn decode<V: DeserializeOwned>(&self) -> Result<CacheEntry<V>> {
        let value: Option<V> = serde_json::from_str(&self.serialized_value).map_err(|e| {
            CacheError::Store(format!("corrupt row for key '{}': {}", self.key, e))
        })?;
        Ok(CacheEntry::with_timestamp(value, self.timestamp_ms))
    }
}

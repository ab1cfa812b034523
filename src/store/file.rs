//! File-backed reference store.
//!
//! Each partition lives in `<dir>/<partition>.json` as an array of rows. Every
//! mutation writes the whole partition to a temporary file, syncs it, then
//! renames it over the previous file, so a crash leaves either the old or the
//! new contents.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::CacheEntry;
use crate::error::{CacheError, Result};
use crate::store::{PersistentStore, StoreProvider, StoredRow};

// == File Store Provider ==
/// Opens file stores under a directory.
#[derive(Debug, Clone)]
pub struct FileStoreProvider {
    dir: PathBuf,
}

impl FileStoreProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl<V> StoreProvider<V> for FileStoreProvider
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn open(&self, partition: &str) -> Result<Arc<dyn PersistentStore<V>>> {
        Ok(Arc::new(FileStore::<V>::open(&self.dir, partition).await?))
    }
}

// == File Store ==
pub struct FileStore<V> {
    partition: String,
    path: PathBuf,
    /// Rows as last written to disk, keyed by canonical key
    rows: Mutex<BTreeMap<String, StoredRow>>,
    _record: PhantomData<fn() -> V>,
}

impl<V> FileStore<V> {
    /// Opens the partition file under `dir`, creating the directory if needed.
    pub async fn open(dir: &Path, partition: &str) -> Result<Self> {
        validate_partition(partition)?;
        fs::create_dir_all(dir).await?;

        let path = dir.join(format!("{}.json", partition));
        let rows = match fs::read(&path).await {
            Ok(bytes) => {
                let rows: Vec<StoredRow> = serde_json::from_slice(&bytes)?;
                rows.into_iter().map(|row| (row.key.clone(), row)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(partition, path = %path.display(), rows = rows.len(), "opened file store");

        Ok(Self {
            partition: partition.to_string(),
            path,
            rows: Mutex::new(rows),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `mutate` to a copy of the rows, persists it, then commits it in
    /// memory. A failed write leaves both disk and memory unchanged.
    async fn update(&self, mutate: impl FnOnce(&mut BTreeMap<String, StoredRow>)) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let mut next = rows.clone();
        mutate(&mut next);

        self.write_atomically(&next).await?;
        *rows = next;
        Ok(())
    }

    async fn write_atomically(&self, rows: &BTreeMap<String, StoredRow>) -> Result<()> {
        let body = serde_json::to_vec(&rows.values().collect::<Vec<_>>())?;
        let tmp = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        debug!(partition = %self.partition, rows = rows.len(), "file store flushed");
        Ok(())
    }
}

#[async_trait]
impl<V> PersistentStore<V> for FileStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn partition(&self) -> &str {
        &self.partition
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        let row = self.rows.lock().await.get(key).cloned();
        row.map(|row| row.decode()).transpose()
    }

    async fn put(&self, key: &str, value: Option<&V>, timestamp_ms: u64) -> Result<()> {
        let row = StoredRow::encode(key, value, timestamp_ms)?;
        self.update(|rows| {
            rows.insert(key.to_string(), row);
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if !self.rows.lock().await.contains_key(key) {
            return Ok(());
        }
        self.update(|rows| {
            rows.remove(key);
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.update(|rows| rows.clear()).await
    }
}

fn validate_partition(partition: &str) -> Result<()> {
    let valid = !partition.is_empty()
        && partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidRequest(format!(
            "partition name '{}' must be non-empty and contain only [A-Za-z0-9_-]",
            partition
        )))
    }
}

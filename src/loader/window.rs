//! Batch window bookkeeping.

use tokio::sync::oneshot;

use crate::error::Result;

/// Resolution of one key: the record, confirmed absence, or an error.
pub type LoadResult<V> = Result<Option<V>>;

// == Batch Window ==
/// Distinct keys accumulated since the window opened, in request order.
///
/// Each key appears once; every caller of that key shares the future tied
/// to its sender.
pub(crate) struct BatchWindow<K, V> {
    pub id: u64,
    pub keys: Vec<K>,
    pub cache_keys: Vec<String>,
    pub senders: Vec<oneshot::Sender<LoadResult<V>>>,
}

impl<K, V> BatchWindow<K, V> {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            keys: Vec::new(),
            cache_keys: Vec::new(),
            senders: Vec::new(),
        }
    }

    pub fn push(&mut self, key: K, cache_key: String, sender: oneshot::Sender<LoadResult<V>>) {
        self.keys.push(key);
        self.cache_keys.push(cache_key);
        self.senders.push(sender);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Splits the window into ordered chunks of at most `max` keys.
    pub fn into_chunks(self, max: usize) -> Vec<WindowChunk<K, V>> {
        let max = max.max(1);
        let mut chunks = Vec::with_capacity(self.keys.len().div_ceil(max));
        let mut keys = self.keys.into_iter();
        let mut cache_keys = self.cache_keys.into_iter();
        let mut senders = self.senders.into_iter();

        loop {
            let chunk = WindowChunk {
                keys: keys.by_ref().take(max).collect(),
                cache_keys: cache_keys.by_ref().take(max).collect(),
                senders: senders.by_ref().take(max).collect(),
            };
            if chunk.keys.is_empty() {
                break;
            }
            chunks.push(chunk);
        }
        chunks
    }
}

/// One upstream call's worth of a window.
pub(crate) struct WindowChunk<K, V> {
    pub keys: Vec<K>,
    pub cache_keys: Vec<String>,
    pub senders: Vec<oneshot::Sender<LoadResult<V>>>,
}

//! Write-set overlay over a [`StateStore`].
//!
//! Every read during a call goes through the overlay first, every write is
//! buffered. The buffered bytes are the call's disk usage. Nothing reaches
//! the backing store until [`StateCache::commit`].

use crate::{in_range, Entry, StateStore, StorageError, WriteKey, WriteOp};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct StateCache {
    store: Arc<dyn StateStore>,
    // None marks a pending delete
    writes: Mutex<BTreeMap<WriteKey, Option<Vec<u8>>>>,
}

impl StateCache {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            writes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(pending) = self.writes.lock().get(&(bucket.to_string(), key.to_vec())) {
            return Ok(pending.clone());
        }
        self.store.get(bucket, key)
    }

    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8]) {
        self.writes
            .lock()
            .insert((bucket.to_string(), key.to_vec()), Some(value.to_vec()));
    }

    pub fn delete(&self, bucket: &str, key: &[u8]) {
        self.writes
            .lock()
            .insert((bucket.to_string(), key.to_vec()), None);
    }

    /// Range scan merging buffered writes over the backing store.
    pub fn scan(
        &self,
        bucket: &str,
        start: &[u8],
        limit: &[u8],
    ) -> Result<Vec<Entry>, StorageError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.store.scan(bucket, start, limit)?.into_iter().collect();

        let writes = self.writes.lock();
        for ((b, key), value) in writes.iter() {
            if b != bucket || !in_range(key, start, limit) {
                continue;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Bytes of keys and values buffered so far.
    pub fn disk_usage(&self) -> u64 {
        self.writes
            .lock()
            .iter()
            .map(|((_, k), v)| (k.len() + v.as_ref().map_or(0, Vec::len)) as u64)
            .sum()
    }

    pub fn is_dirty(&self) -> bool {
        !self.writes.lock().is_empty()
    }

    /// Drop every buffered write.
    pub fn discard(&self) {
        self.writes.lock().clear();
    }

    /// Flush the write set to the backing store in one batch. On failure
    /// nothing is written and the write set is kept.
    pub fn commit(&self) -> Result<usize, StorageError> {
        let mut writes = self.writes.lock();
        if writes.is_empty() {
            return Ok(0);
        }

        let batch: Vec<WriteOp> = writes
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.store.write_batch(&batch)?;
        writes.clear();

        tracing::debug!(entries = batch.len(), "committed state write set");
        Ok(batch.len())
    }
}

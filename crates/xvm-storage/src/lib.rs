//! XVM Storage - contract state backends and the per-call write-set overlay

pub mod error;
pub mod state_cache;

pub use error::StorageError;
pub use state_cache::StateCache;

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Key/value pair returned by range scans.
pub type Entry = (Vec<u8>, Vec<u8>);

/// `(bucket, key)` address of one value.
pub type WriteKey = (String, Vec<u8>);

/// One change in a batch, `None` deletes the key.
pub type WriteOp = (WriteKey, Option<Vec<u8>>);

/// Bucketed key-value store backing contract state.
pub trait StateStore: Send + Sync {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<(), StorageError>;

    /// Entries with `start <= key < limit` in key order. An empty `limit`
    /// leaves the range open.
    fn scan(&self, bucket: &str, start: &[u8], limit: &[u8]) -> Result<Vec<Entry>, StorageError>;

    /// Apply every change or none of them.
    fn write_batch(&self, batch: &[WriteOp]) -> Result<(), StorageError>;
}

fn in_range(key: &[u8], start: &[u8], limit: &[u8]) -> bool {
    key >= start && (limit.is_empty() || key < limit)
}

/// Database - Simple JSON file-based storage
pub struct Database {
    path: PathBuf,
    data: Arc<RwLock<serde_json::Value>>,
}

impl Database {
    pub fn new(path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(path)?;

        let data_file = path.join("data.json");
        let data = if data_file.exists() {
            let content = fs::read_to_string(&data_file)?;
            serde_json::from_str(&content)?
        } else {
            serde_json::json!({})
        };

        Ok(Self {
            path: path.to_path_buf(),
            data: Arc::new(RwLock::new(data)),
        })
    }

    fn persist(&self, data: &serde_json::Value) -> Result<(), StorageError> {
        let data_file = self.path.join("data.json");
        let tmp_file = self.path.join("data.json.tmp");
        let content = serde_json::to_string_pretty(data)?;
        fs::write(&tmp_file, content)?;
        fs::rename(&tmp_file, &data_file)?;
        Ok(())
    }
}

impl StateStore for Database {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read();
        let key_hex = hex::encode(key);

        match data
            .get(bucket)
            .and_then(|b| b.get(&key_hex))
            .and_then(|v| v.as_str())
        {
            Some(value) => Ok(Some(hex::decode(value)?)),
            None => Ok(None),
        }
    }

    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.write_batch(&[((bucket.to_string(), key.to_vec()), Some(value.to_vec()))])
    }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<(), StorageError> {
        self.write_batch(&[((bucket.to_string(), key.to_vec()), None)])
    }

    fn scan(&self, bucket: &str, start: &[u8], limit: &[u8]) -> Result<Vec<Entry>, StorageError> {
        let data = self.data.read();
        let Some(obj) = data.get(bucket).and_then(|b| b.as_object()) else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for (key_hex, value) in obj {
            let key = hex::decode(key_hex)?;
            if !in_range(&key, start, limit) {
                continue;
            }
            if let Some(value) = value.as_str() {
                entries.push((key, hex::decode(value)?));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Applies the batch to a copy and swaps it in only once the file has
    /// been replaced.
    fn write_batch(&self, batch: &[WriteOp]) -> Result<(), StorageError> {
        let mut data = self.data.write();
        let mut next = data.clone();
        if !next.is_object() {
            next = serde_json::json!({});
        }

        if let Some(root) = next.as_object_mut() {
            for ((bucket, key), value) in batch {
                let key_hex = hex::encode(key);
                match value {
                    Some(value) => {
                        let entry = root
                            .entry(bucket.clone())
                            .or_insert_with(|| serde_json::json!({}));
                        if let Some(obj) = entry.as_object_mut() {
                            obj.insert(key_hex, serde_json::json!(hex::encode(value)));
                        }
                    }
                    None => {
                        if let Some(obj) = root.get_mut(bucket).and_then(|b| b.as_object_mut()) {
                            obj.remove(&key_hex);
                        }
                    }
                }
            }
        }

        self.persist(&next)?;
        *data = next;
        Ok(())
    }
}

/// In-memory store, used by tests and the runner's dry-run mode.
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned())
    }

    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<(), StorageError> {
        if let Some(b) = self.buckets.write().get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn scan(&self, bucket: &str, start: &[u8], limit: &[u8]) -> Result<Vec<Entry>, StorageError> {
        let buckets = self.buckets.read();
        Ok(buckets
            .get(bucket)
            .map(|b| {
                b.iter()
                    .filter(|(k, _)| in_range(k, start, limit))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn write_batch(&self, batch: &[WriteOp]) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write();
        for ((bucket, key), value) in batch {
            match value {
                Some(value) => {
                    buckets
                        .entry(bucket.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                None => {
                    if let Some(b) = buckets.get_mut(bucket) {
                        b.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}

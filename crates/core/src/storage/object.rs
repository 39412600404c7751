use std::collections::BTreeMap;
use std::sync::Mutex;

use super::error::{Result, StorageError};
use super::Storage;

/// Minimal client surface of a remote object store.
///
/// Objects move as whole buffers; there is no streaming.
pub trait ObjectStoreClient: Send + Sync {
    /// Full keys of every object whose key starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Object store held in memory. Used for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn objects(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.objects
            .lock()
            .map_err(|_| StorageError::Remote("object map poisoned".to_string()))
    }
}

impl ObjectStoreClient for InMemoryObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects()?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.objects()?.insert(key.to_string(), data);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects()?.remove(key);
        Ok(())
    }
}

/// [`Storage`] backed by an object store client under a bucket prefix.
pub struct ObjectStorage<C: ObjectStoreClient> {
    client: C,
    bucket: String,
}

impl<C: ObjectStoreClient> ObjectStorage<C> {
    /// `bucket` is prepended to every key, e.g. `hdd:s3://models`.
    pub fn new(client: C, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn full_key(&self, key: &str) -> String {
        super::join_key(&self.bucket, key.trim_start_matches('/'))
    }

    fn dir_prefix(&self, prefix: &str) -> String {
        let full = self.full_key(prefix);
        if full.is_empty() || full.ends_with('/') {
            full
        } else {
            format!("{full}/")
        }
    }
}

impl<C: ObjectStoreClient> Storage for ObjectStorage<C> {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.dir_prefix(prefix);
        let mut keys: Vec<String> = self
            .client
            .list(&dir)?
            .into_iter()
            .filter_map(|full| {
                let rest = full.strip_prefix(&dir)?;
                (!rest.is_empty() && !rest.contains('/'))
                    .then(|| super::join_key(prefix, rest))
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.client.get(&self.full_key(key))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.client.put(&self.full_key(key), data.to_vec())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let full = self.full_key(key);
        Ok(self.client.list(&full)?.iter().any(|k| *k == full))
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let full = self.full_key(prefix);
        let dir = self.dir_prefix(prefix);
        for key in self.client.list(&full)? {
            if key == full || key.starts_with(&dir) {
                self.client.delete(&key)?;
            }
        }
        Ok(())
    }

    fn describe(&self, key: &str) -> String {
        self.full_key(key)
    }
}

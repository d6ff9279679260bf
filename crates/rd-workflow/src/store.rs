//! Resumable key-value stores.
//!
//! The namespace is shared: a store may hold entries belonging to other runs
//! or other concerns entirely, so callers only ever touch keys they own.

use dashmap::DashMap;
use parking_lot::Mutex;
use rd_types::{OptResult, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Set/get/delete/list over a shared namespace of JSON values.
pub trait StateStore: Send + Sync {
    fn set(&self, key: &str, value: Value) -> OptResult<()>;

    fn get(&self, key: &str) -> OptResult<Option<Value>>;

    /// Remove `key`; returns whether it was present.
    fn delete(&self, key: &str) -> OptResult<bool>;

    /// All keys starting with `prefix`, sorted.
    fn list_keys(&self, prefix: &str) -> OptResult<Vec<String>>;
}

impl<S: StateStore + ?Sized> StateStore for Arc<S> {
    fn set(&self, key: &str, value: Value) -> OptResult<()> {
        (**self).set(key, value)
    }

    fn get(&self, key: &str) -> OptResult<Option<Value>> {
        (**self).get(key)
    }

    fn delete(&self, key: &str) -> OptResult<bool> {
        (**self).delete(key)
    }

    fn list_keys(&self, prefix: &str) -> OptResult<Vec<String>> {
        (**self).list_keys(prefix)
    }
}

/// Typed access on top of any [`StateStore`].
pub trait StateStoreExt: StateStore {
    fn put<T: Serialize>(&self, key: &str, value: &T) -> OptResult<()> {
        self.set(key, serde_json::to_value(value)?)
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> OptResult<Option<T>> {
        match self.get(key)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                StoreError::Corrupted {
                    key: key.to_string(),
                    message: e.to_string(),
                }
                .into()
            }),
        }
    }

    fn require<T: DeserializeOwned>(&self, key: &str) -> OptResult<T> {
        self.load(key)?.ok_or_else(|| {
            StoreError::NotFound {
                key: key.to_string(),
            }
            .into()
        })
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn set(&self, key: &str, value: Value) -> OptResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> OptResult<Option<Value>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn delete(&self, key: &str) -> OptResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn list_keys(&self, prefix: &str) -> OptResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// A whole namespace kept in one JSON document on disk.
///
/// Every mutation rewrites the document through a temporary file and an
/// atomic rename, so a reader after a crash sees either the old or the new
/// namespace, never a torn one. Only one process may write a given file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    /// Open (or lazily create) the namespace at `path`.
    pub fn open(path: impl AsRef<Path>) -> OptResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupted {
                key: path.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "opened file store");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> OptResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn set(&self, key: &str, value: Value) -> OptResult<()> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        next.insert(key.to_string(), value);
        // Memory only follows once the disk has the new namespace.
        self.flush(&next)?;
        *entries = next;
        Ok(())
    }

    fn get(&self, key: &str) -> OptResult<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> OptResult<bool> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(key);
        self.flush(&next)?;
        *entries = next;
        Ok(true)
    }

    fn list_keys(&self, prefix: &str) -> OptResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

//! Durable key/value state for aggregation buffers.
//!
//! Each key maps to one JSON file under the store's root directory, written
//! atomically via a temp file and rename so a crash mid-write never leaves a
//! torn value behind. A memory-backed variant exists for tests and for
//! callers that do not need crash recovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::Error;

/// Key/value store backing aggregation state across restarts.
#[derive(Debug)]
pub enum StateStore {
    Disk(DiskStore),
    Memory(MemoryStore),
}

impl StateStore {
    /// Opens a disk-backed store rooted at `dir`, creating it if needed.
    pub fn disk(dir: &Path) -> Result<Self, Error> {
        Ok(Self::Disk(DiskStore::open(dir)?))
    }

    /// Creates an in-memory store. State does not survive the process.
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::default())
    }

    /// Loads and decodes the value stored under `key`. Returns `Ok(None)`
    /// when the key has never been stored.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        let data = match self {
            Self::Disk(store) => store.read(key)?,
            Self::Memory(store) => store.read(key),
        };
        match data {
            Some(data) => {
                let value = serde_json::from_slice(&data)
                    .map_err(|e| Error::Validation(format!("state under {key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Encodes and durably stores `value` under `key`, replacing any
    /// previous value.
    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        let data = serde_json::to_vec(value)
            .map_err(|e| Error::Validation(format!("state under {key}: {e}")))?;
        match self {
            Self::Disk(store) => store.write(key, &data),
            Self::Memory(store) => {
                store.write(key, data);
                Ok(())
            }
        }
    }

    /// Removes the value stored under `key`. Removing an absent key is not
    /// an error.
    pub fn remove(&self, key: &str) -> Result<(), Error> {
        match self {
            Self::Disk(store) => store.remove(key),
            Self::Memory(store) => {
                store.remove(key);
                Ok(())
            }
        }
    }
}

/// One JSON file per key under a root directory.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    fn open(dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            root: dir.to_path_buf(),
        })
    }

    /// Maps a key like `aggregator/requests` to a file path under the root.
    /// Path separators in keys become subdirectories.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path.set_extension("json");
        path
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match std::fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write to a sibling temp file and rename into place so readers
        // never observe a partial value.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        debug!(key = %key, bytes = data.len(), "stored state");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volatile store used in tests and for callers without a state directory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn write(&self, key: &str, data: Vec<u8>) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), data);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(key);
        }
    }
}

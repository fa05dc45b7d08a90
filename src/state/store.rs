//! Key/value persistence for planner state.
//!
//! Components never touch files directly; they go through a `StateStore`.
//! Keys are slash-separated paths such as `checkpoints/index`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{Error, Result};

/// Extension appended to every key on disk.
const RECORD_EXT: &str = "json";

/// Storage backend for durable state records.
pub trait StateStore: Send + Sync {
    /// Read the record at `key`.
    ///
    /// Returns `None` if the record doesn't exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create the record at `key`.
    ///
    /// # Errors
    /// Returns `Error::Store` if the record already exists.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Create or atomically overwrite the record at `key`.
    fn replace(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete the record at `key`. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool>;

    /// List keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Reject empty keys, empty segments, and parent traversal.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Store("empty key".to_string()));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::Store(format!("invalid key {:?}", key)));
        }
    }
    Ok(())
}

/// Read and deserialize a JSON record.
pub fn load_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and atomically write a JSON record.
pub fn save_json<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.replace(key, &bytes)
}

/// Stores each record as `<root>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let mut path = self.root.clone();
        let mut segments = key.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{}.{}", segment, RECORD_EXT));
            }
        }
        Ok(path)
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Ok(relative) = path.with_extension("").strip_prefix(&self.root).map(Path::to_path_buf)
            else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
        Ok(())
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Store(format!("record {} already exists", key)));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(value)?;
        file.sync_all()?;
        debug!(key, bytes = value.len(), "created record");
        Ok(())
    }

    fn replace(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path)?;

        if path.exists() {
            let backup_path = path.with_extension("json.bak");
            fs::copy(&path, &backup_path)?;
        }

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, value)?;
        fs::rename(&temp_path, &path)?;
        debug!(key, bytes = value.len(), "replaced record");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                let _ = fs::remove_file(path.with_extension("json.bak"));
                debug!(key, "removed record");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.records
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.records()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut records = self.records()?;
        if records.contains_key(key) {
            return Err(Error::Store(format!("record {} already exists", key)));
        }
        records.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn replace(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.records()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.records()?.remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .records()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

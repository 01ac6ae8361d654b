//! Durable JSON blob storage: atomic file writes behind a small key-value interface.
//!
//! Plans, chunk checkpoints, syntheses and the task queue are all stored as
//! JSON documents addressed by slash-separated keys (`plans/<id>`,
//! `chunks/<plan_id>/<index>`, ...). `FileStore` maps every key to
//! `<root>/<key>.json` and writes through a `.tmp` sibling followed by a
//! rename so a crash never leaves a half-written document behind.

use crate::error::PersistenceError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A key-value store of JSON documents with atomic replace semantics.
pub trait KeyValueStore: Send + Sync {
    /// Fetch a document, or `None` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError>;

    /// Atomically create or replace a document.
    fn put(&self, key: &str, value: &Value) -> Result<(), PersistenceError>;

    /// Delete a document. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, PersistenceError>;

    /// List keys that start with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, PersistenceError>;
}

/// Load and deserialize a typed document.
pub fn load_typed<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, PersistenceError> {
    match store.get(key)? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| PersistenceError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Serialize and atomically store a typed document.
pub fn save_typed<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    data: &T,
) -> Result<(), PersistenceError> {
    let value = serde_json::to_value(data).map_err(|e| PersistenceError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    store.put(key, &value)
}

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a `.tmp` sibling file,
/// then atomically renames to the target path.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// File-backed store: one pretty-printed JSON file per key under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty() && *s != "..") {
            path.push(segment);
        }
        let mut file = path.into_os_string();
        file.push(".json");
        PathBuf::from(file)
    }

    fn io_error(path: &Path, e: io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> io::Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if path.extension().is_some_and(|e| e == "json")
                && let Ok(rel) = path.strip_prefix(&self.root)
            {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if let Some(key) = rel.strip_suffix(".json") {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        let path = self.path_for(key);
        load_json(&path).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => PersistenceError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            },
            _ => Self::io_error(&path, e),
        })
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), PersistenceError> {
        let path = self.path_for(key);
        atomic_write_json(&path, value).map_err(|e| Self::io_error(&path, e))
    }

    fn delete(&self, key: &str) -> Result<bool, PersistenceError> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)
            .map_err(|e| Self::io_error(&self.root, e))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryStore {
    docs: Mutex<BTreeMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned(key: &str) -> PersistenceError {
        PersistenceError::Io {
            path: PathBuf::from(key),
            message: "in-memory store lock poisoned".to_string(),
        }
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        let docs = self.docs.lock().map_err(|_| Self::poisoned(key))?;
        Ok(docs.get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), PersistenceError> {
        let mut docs = self.docs.lock().map_err(|_| Self::poisoned(key))?;
        docs.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, PersistenceError> {
        let mut docs = self.docs.lock().map_err(|_| Self::poisoned(key))?;
        Ok(docs.remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let docs = self.docs.lock().map_err(|_| Self::poisoned(prefix))?;
        Ok(docs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

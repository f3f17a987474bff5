//! Key-value backends for the field registry.
//!
//! A [`RegistryStore`] must never drop entries on its own: no expiry, no
//! size-based culling. A registry that forgets field sets silently loses
//! what it has learned, so both built-in backends keep everything until
//! told otherwise.
//!
//! - [`MemoryStore`] - process-local map, for tests and short-lived tools
//! - [`FileStore`] - one JSON file per key in a directory, shared between
//!   processes on the same machine

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fetchplan_core::{OptimizerError, OptimizerResult, RegistrySettings};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// A non-evicting key-value backend.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> OptimizerResult<Option<serde_json::Value>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: serde_json::Value) -> OptimizerResult<()>;

    /// Removes `key`. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> OptimizerResult<bool>;

    /// Removes every entry.
    async fn clear(&self) -> OptimizerResult<()>;
}

/// Builds the backend named by the settings.
pub fn store_from_settings(settings: &RegistrySettings) -> OptimizerResult<Arc<dyn RegistryStore>> {
    match settings.backend.as_str() {
        "file" => Ok(Arc::new(FileStore::new(settings.location.clone()))),
        "memory" => Ok(Arc::new(MemoryStore::new())),
        other => Err(OptimizerError::ImproperlyConfigured(format!(
            "Unknown field registry backend '{other}'; expected 'file' or 'memory'"
        ))),
    }
}

/// A process-local store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn get(&self, key: &str) -> OptimizerResult<Option<serde_json::Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> OptimizerResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> OptimizerResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn clear(&self) -> OptimizerResult<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

/// A directory of JSON files, one per key.
///
/// File names are the SHA-256 of the key so any key maps to a valid name;
/// the key itself is stored inside the file.
#[derive(Debug, Clone)]
pub struct FileStore {
    /// The directory where entries are stored.
    pub dir: PathBuf,
}

/// Serialized representation of a file store entry.
#[derive(Serialize, Deserialize)]
struct FileEntry {
    key: String,
    value: serde_json::Value,
}

const ENTRY_EXTENSION: &str = "entry";

impl FileStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}.{ENTRY_EXTENSION}", hex::encode(digest)))
    }
}

#[async_trait]
impl RegistryStore for FileStore {
    async fn get(&self, key: &str) -> OptimizerResult<Option<serde_json::Value>> {
        let path = self.key_path(key);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let entry: FileEntry = serde_json::from_slice(&data)?;
                if entry.key != key {
                    return Err(OptimizerError::StoreError(format!(
                        "{} holds key '{}', expected '{key}'",
                        path.display(),
                        entry.key
                    )));
                }
                Ok(Some(entry.value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OptimizerError::IoError(e)),
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> OptimizerResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let entry = FileEntry {
            key: key.to_string(),
            value,
        };
        let data = serde_json::to_vec(&entry)?;
        let dir = self.dir.clone();
        let path = self.key_path(key);
        // Each writer renames its own temp file over the entry, so readers
        // and other writers only ever see whole files.
        tokio::task::spawn_blocking(move || -> OptimizerResult<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.persist(&path).map_err(|e| OptimizerError::IoError(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| OptimizerError::StoreError(format!("file store write failed: {e}")))?
    }

    async fn delete(&self, key: &str) -> OptimizerResult<bool> {
        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OptimizerError::IoError(e)),
        }
    }

    async fn clear(&self) -> OptimizerResult<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

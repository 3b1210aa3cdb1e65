//! Store persistence.
//!
//! A [`Persistence`] backend holds one versioned JSON document per
//! conversation key. Loading returns the raw document so the migration chain
//! can run before it is decoded. Engines report progress through a
//! [`Checkpoint`] so a long cycle loses at most one unit of work.

use crate::store::MemoryStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where stores live between processes.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// The stored document for `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<Value>, PersistError>;

    async fn save(&self, key: &str, store: &MemoryStore) -> Result<(), PersistError>;

    async fn delete(&self, key: &str) -> Result<(), PersistError>;
}

/// One pretty-printed JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct JsonDirPersistence {
    dir: PathBuf,
}

impl JsonDirPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a key.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.memory.json", file_stem(key)))
    }
}

/// A file-name-safe encoding of `key`, distinct for distinct keys.
///
/// ASCII alphanumerics and `-` are kept; every other byte, `_` included,
/// becomes `_` followed by two hex digits.
pub fn file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

#[async_trait]
impl Persistence for JsonDirPersistence {
    async fn load(&self, key: &str) -> Result<Option<Value>, PersistError> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn save(&self, key: &str, store: &MemoryStore) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_string_pretty(store)?;

        // Write then rename so a crash never leaves a truncated document.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PersistError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local persistence, for tests and hosts that keep nothing on disk.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    documents: Mutex<HashMap<String, Value>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw document, e.g. an old-version store.
    pub async fn insert_raw(&self, key: impl Into<String>, document: Value) {
        self.documents.lock().await.insert(key.into(), document);
    }

    pub async fn raw(&self, key: &str) -> Option<Value> {
        self.documents.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn load(&self, key: &str) -> Result<Option<Value>, PersistError> {
        Ok(self.raw(key).await)
    }

    async fn save(&self, key: &str, store: &MemoryStore) -> Result<(), PersistError> {
        let document = serde_json::to_value(store)?;
        self.insert_raw(key, document).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PersistError> {
        self.documents.lock().await.remove(key);
        Ok(())
    }
}

/// Progress sink called by the engines after each committed unit of work.
///
/// Best effort: a failed checkpoint is logged by the implementation and never
/// aborts the engine that called it.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn checkpoint(&self, store: &MemoryStore);
}

/// Checkpoint that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCheckpoint;

#[async_trait]
impl Checkpoint for NoCheckpoint {
    async fn checkpoint(&self, _store: &MemoryStore) {}
}

/// Checkpoint that saves to a backend under a fixed key.
pub struct SaveCheckpoint<'a> {
    backend: &'a dyn Persistence,
    key: &'a str,
}

impl<'a> SaveCheckpoint<'a> {
    pub fn new(backend: &'a dyn Persistence, key: &'a str) -> Self {
        Self { backend, key }
    }
}

#[async_trait]
impl Checkpoint for SaveCheckpoint<'_> {
    async fn checkpoint(&self, store: &MemoryStore) {
        if let Err(e) = self.backend.save(self.key, store).await {
            tracing::warn!(key = %self.key, error = %e, "checkpoint save failed");
        }
    }
}

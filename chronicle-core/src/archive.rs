//! Named-slot archival transport.
//!
//! Separate from [`crate::persist::Persistence`]: persistence holds the one
//! live document per key, while an archive keeps any number of uploaded
//! copies, each addressed by the [`Locator`] the upload returned.

use crate::persist::file_stem;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

/// Errors from archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no archived blob at {0}")]
    NotFound(Locator),

    #[error("invalid locator: {0}")]
    InvalidLocator(Locator),
}

/// Opaque handle to an uploaded blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Locator(String);

impl Locator {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upload, fetch and delete blobs under named slots.
#[async_trait]
pub trait ArchiveTransport: Send + Sync {
    async fn upload(&self, slot: &str, blob: Vec<u8>) -> Result<Locator, ArchiveError>;

    async fn fetch(&self, locator: &Locator) -> Result<Vec<u8>, ArchiveError>;

    async fn delete(&self, locator: &Locator) -> Result<(), ArchiveError>;
}

/// True for the part of an upload name after `{slot}_`:
/// `YYYYMMDDTHHMMSSmmm_xxxxxxxx.json`.
fn is_upload_suffix(rest: &str) -> bool {
    let Some(stem) = rest.strip_suffix(".json") else {
        return false;
    };
    let Some((stamp, nonce)) = stem.split_once('_') else {
        return false;
    };
    let Some((date, time)) = stamp.split_once('T') else {
        return false;
    };
    date.len() == 8
        && time.len() == 9
        && date.bytes().chain(time.bytes()).all(|b| b.is_ascii_digit())
        && nonce.len() == 8
        && nonce.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Blobs as files in one directory. Locators are file names.
#[derive(Debug, Clone)]
pub struct DirArchive {
    dir: PathBuf,
}

impl DirArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_of(&self, locator: &Locator) -> Result<PathBuf, ArchiveError> {
        let name = locator.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ArchiveError::InvalidLocator(locator.clone()));
        }
        Ok(self.dir.join(name))
    }

    /// Every locator in the directory for `slot`, newest first.
    pub async fn list(&self, slot: &str) -> Result<Vec<Locator>, ArchiveError> {
        let prefix = format!("{}_", file_stem(slot));
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut locators = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.strip_prefix(&prefix).is_some_and(is_upload_suffix) {
                locators.push(Locator(name));
            }
        }
        // Names embed the upload time, so reverse name order is newest first.
        locators.sort_by(|a, b| b.cmp(a));
        Ok(locators)
    }
}

#[async_trait]
impl ArchiveTransport for DirArchive {
    async fn upload(&self, slot: &str, blob: Vec<u8>) -> Result<Locator, ArchiveError> {
        fs::create_dir_all(&self.dir).await?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let locator = Locator(format!("{}_{stamp}_{}.json", file_stem(slot), &nonce[..8]));
        fs::write(self.path_of(&locator)?, blob).await?;
        tracing::debug!(locator = %locator, "archived blob");
        Ok(locator)
    }

    async fn fetch(&self, locator: &Locator) -> Result<Vec<u8>, ArchiveError> {
        match fs::read(self.path_of(locator)?).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArchiveError::NotFound(locator.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, locator: &Locator) -> Result<(), ArchiveError> {
        match fs::remove_file(self.path_of(locator)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local archive.
#[derive(Debug, Default)]
pub struct InMemoryArchive {
    blobs: Mutex<HashMap<Locator, Vec<u8>>>,
    uploads: Mutex<u64>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }
}

#[async_trait]
impl ArchiveTransport for InMemoryArchive {
    async fn upload(&self, slot: &str, blob: Vec<u8>) -> Result<Locator, ArchiveError> {
        let mut uploads = self.uploads.lock().await;
        *uploads += 1;
        let locator = Locator(format!("{}#{}", file_stem(slot), *uploads));
        self.blobs.lock().await.insert(locator.clone(), blob);
        Ok(locator)
    }

    async fn fetch(&self, locator: &Locator) -> Result<Vec<u8>, ArchiveError> {
        self.blobs
            .lock()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(locator.clone()))
    }

    async fn delete(&self, locator: &Locator) -> Result<(), ArchiveError> {
        self.blobs.lock().await.remove(locator);
        Ok(())
    }
}

//! Key/value backends for blob chunks
//!
//! Keys are `/`-separated relative paths. Values are opaque bytes.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid key: {0}")]
    InvalidPath(String),
    #[error("Corrupt blob {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Flat key/value blob backend
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write `data` under `key`, replacing any previous value
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Backend name used in log fields
    fn name(&self) -> &str;
}

/// Backend storing each key as a file below a root directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key below the root; keys may not escape it
    fn file_for(&self, key: &str) -> StorageResult<PathBuf> {
        let escapes = key.starts_with('/')
            || key.contains('\\')
            || key.split('/').any(|segment| segment == "..");
        if key.is_empty() || escapes {
            return Err(StorageError::InvalidPath(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    #[instrument(skip(self, data), fields(storage = "local", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.file_for(key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        // Readers never observe a half-written value
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        fs::write(&partial, &data).await?;
        fs::rename(&partial, &path).await?;

        debug!(path = %path.display(), "Blob stored");
        Ok(())
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.file_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.file_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.file_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Backend holding everything in a map; used by tests and dry runs
#[derive(Debug)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Keys starting with `prefix`, sorted
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let blobs = self.blobs.read().await;
        let mut keys: Vec<String> = blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let blobs = self.blobs.read().await;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut blobs = self.blobs.write().await;
        blobs.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let blobs = self.blobs.read().await;
        Ok(blobs.contains_key(key))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

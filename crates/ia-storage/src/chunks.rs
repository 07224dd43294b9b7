//! Chunked blobs
//!
//! A blob is split into fixed-size chunks stored under `<key>/chunks/<n>`
//! and described by a JSON manifest at `<key>/manifest.json`. The manifest is
//! written after the chunks, so a reader never sees a manifest whose chunks
//! are missing.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::backend::{Storage, StorageError, StorageResult};

/// Manifest describing a stored blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobManifest {
    /// Total length in bytes
    pub length: u64,
    pub chunk_size: usize,
    /// Number of chunks
    pub chunks: usize,
    /// SHA256 digest of the whole blob
    pub digest: String,
    /// MIME content type
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Calculate SHA256 digest
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Chunked blob layer over a key/value storage backend
pub struct ChunkedBlobs<S: Storage> {
    storage: Arc<S>,
    chunk_size: usize,
}

impl<S: Storage> ChunkedBlobs<S> {
    pub fn new(storage: Arc<S>, chunk_size: usize) -> Self {
        Self {
            storage,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn manifest_key(key: &str) -> String {
        format!("{}/manifest.json", key)
    }

    fn chunk_key(key: &str, index: usize) -> String {
        format!("{}/chunks/{:06}", key, index)
    }

    /// Read the manifest of a blob, if present
    pub async fn manifest(&self, key: &str) -> StorageResult<Option<BlobManifest>> {
        let raw = match self.storage.get(&Self::manifest_key(key)).await {
            Ok(raw) => raw,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("unreadable manifest: {}", e),
            })
    }

    /// Write a blob, replacing any previous one under `key`
    #[instrument(skip(self, data), fields(storage = self.storage.name(), size = data.len()))]
    pub async fn write(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<BlobManifest> {
        let previous = self.manifest(key).await?;

        let mut chunks = 0;
        let mut start = 0;
        while start < data.len() {
            let end = (start + self.chunk_size).min(data.len());
            self.storage
                .put(&Self::chunk_key(key, chunks), data.slice(start..end))
                .await?;
            chunks += 1;
            start = end;
        }

        let manifest = BlobManifest {
            length: data.len() as u64,
            chunk_size: self.chunk_size,
            chunks,
            digest: digest(&data),
            content_type: content_type.to_string(),
            uploaded_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&manifest).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.storage
            .put(&Self::manifest_key(key), Bytes::from(raw))
            .await?;

        if let Some(previous) = previous {
            for index in chunks..previous.chunks {
                self.storage.delete(&Self::chunk_key(key, index)).await?;
            }
        }

        debug!(key, chunks, "Blob written");
        Ok(manifest)
    }

    /// Read and verify a blob
    #[instrument(skip(self), fields(storage = self.storage.name()))]
    pub async fn read(&self, key: &str) -> StorageResult<Bytes> {
        let manifest = self
            .manifest(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        let mut buffer = BytesMut::with_capacity(manifest.length as usize);
        for index in 0..manifest.chunks {
            let chunk = match self.storage.get(&Self::chunk_key(key, index)).await {
                Ok(chunk) => chunk,
                Err(StorageError::NotFound(_)) => {
                    return Err(StorageError::Corrupt {
                        key: key.to_string(),
                        reason: format!("chunk {} missing", index),
                    })
                }
                Err(e) => return Err(e),
            };
            buffer.extend_from_slice(&chunk);
        }

        if buffer.len() as u64 != manifest.length {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("expected {} bytes, found {}", manifest.length, buffer.len()),
            });
        }
        if digest(&buffer) != manifest.digest {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: "digest mismatch".to_string(),
            });
        }

        Ok(buffer.freeze())
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.storage.exists(&Self::manifest_key(key)).await
    }

    /// Remove a blob; returns false if nothing was stored
    #[instrument(skip(self), fields(storage = self.storage.name()))]
    pub async fn remove(&self, key: &str) -> StorageResult<bool> {
        let Some(manifest) = self.manifest(key).await? else {
            return Ok(false);
        };

        self.storage.delete(&Self::manifest_key(key)).await?;
        for index in 0..manifest.chunks {
            self.storage.delete(&Self::chunk_key(key, index)).await?;
        }

        debug!(key, chunks = manifest.chunks, "Blob removed");
        Ok(true)
    }
}

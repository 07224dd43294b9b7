//! # ia-storage
//!
//! Durable storage for document attachments.
//!
//! ## Features
//!
//! - Storage abstraction (local filesystem, in-memory)
//! - Chunked blobs with SHA256-verified manifests
//! - Attachment store: add, update, remove, full and partial loads
//! - Document and attachment model
//!
//! ## Example
//!
//! ```rust,ignore
//! use ia_storage::{AttachmentStore, Document, GridAttachmentStore, MemoryStorage};
//! use std::sync::Arc;
//!
//! let store = GridAttachmentStore::new(Arc::new(MemoryStorage::new()), &config);
//! let mut doc = Document::new();
//!
//! store.add(&mut doc, "license.pdf", bytes::Bytes::from(pdf)).await?;
//! store.save(&doc).await?;
//! ```

pub mod backend;
pub mod chunks;
pub mod model;
pub mod store;

pub use backend::{LocalStorage, MemoryStorage, Storage, StorageError, StorageResult};
pub use chunks::{digest, BlobManifest, ChunkedBlobs};
pub use model::{Attachment, Document};
pub use store::{AttachmentStore, GridAttachmentStore, StoreError, StoreResult};

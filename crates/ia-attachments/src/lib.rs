//! Image attachment lifecycle
//!
//! Documents carry named binary attachments. When content is added or
//! updated it is identified by an image engine and, if it is an image,
//! resized into each configured derivative. Mutations of one document are
//! serialized by a per-document write lock.
//!
//! | Module | Role |
//! |---|---|
//! | [`lock`] | Per-document write locks |
//! | [`scratch`] | Temporary files handed to the image engine |
//! | [`derive`] | Identify and resize pipeline |
//! | [`service`] | Document operations: add, update, remove, load |
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use ia_attachments::ImageAttachments;
//! use ia_core::{DerivativeSpec, ImagesConfig};
//! use ia_storage::{Document, MemoryStorage};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ImagesConfig::default().with_derivative("small", DerivativeSpec::thumbnail(256, 256));
//! let attachments = ImageAttachments::from_storage(Arc::new(MemoryStorage::new()), config)?;
//!
//! let mut doc = Document::new();
//! attachments
//!     .add_image(&mut doc, "kitten.jpg", Bytes::from(std::fs::read("kitten.jpg")?))
//!     .await?;
//! attachments.save(&doc).await?;
//! # Ok(())
//! # }
//! ```

pub mod derive;
pub mod error;
pub mod lock;
pub mod scratch;
pub mod service;

pub use derive::{Derivation, Deriver};
pub use error::{AttachmentsError, AttachmentsResult};
pub use lock::{LockRegistry, WriteGuard};
pub use scratch::{ScratchFile, ScratchSpace};
pub use service::ImageAttachments;

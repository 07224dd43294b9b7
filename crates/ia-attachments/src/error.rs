//! Attachment operation errors

use ia_core::ValidationError;
use ia_images::ImageError;
use ia_storage::StoreError;
use thiserror::Error;

/// Errors surfaced by image attachment operations
///
/// Non-image content is not an error: it yields `Derivation::NotAnImage`.
#[derive(Debug, Error)]
pub enum AttachmentsError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Attachment not in document: {0}")]
    MissingAttachment(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Image error: {0}")]
    Image(#[from] ImageError),
    #[error("Scratch storage error: {0}")]
    Scratch(#[from] std::io::Error),
}

pub type AttachmentsResult<T> = Result<T, AttachmentsError>;

impl AttachmentsError {
    /// The image engine could not run
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, Self::Image(e) if e.is_engine_unavailable())
    }

    /// The store has no attachment with the requested filename
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::NotFound(_)) | Self::MissingAttachment(_)
        )
    }
}

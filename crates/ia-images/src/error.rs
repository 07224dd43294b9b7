//! Image service errors

use thiserror::Error;

/// Image service errors
///
/// Callers branch on the variant: `Unrecognized` means the content is not an
/// image, `EngineUnavailable` means the engine itself cannot run.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Unrecognized image format: {0}")]
    Unrecognized(String),
    #[error("Image engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("Image processing failed: {0}")]
    Processing(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ImageResult<T> = Result<T, ImageError>;

impl ImageError {
    /// Content is not a recognized image
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Self::Unrecognized(_))
    }

    /// The engine could not run at all
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, Self::EngineUnavailable(_))
    }
}

//! Image service trait

use std::path::Path;

use async_trait::async_trait;
use ia_core::{ImageMetadata, ResizeOp};

use crate::error::ImageResult;

/// Identify and resize images stored as files
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Describe the image at `path`
    ///
    /// Fails with `ImageError::Unrecognized` when the file is not an image.
    async fn identify(&self, path: &Path) -> ImageResult<ImageMetadata>;

    /// Write `source` resized by `op` to `target`, keeping the source format
    async fn resize(&self, source: &Path, target: &Path, op: ResizeOp) -> ImageResult<()>;

    /// Whether the engine can run
    async fn health_check(&self) -> bool;

    /// Engine name for logging
    fn name(&self) -> &str;
}

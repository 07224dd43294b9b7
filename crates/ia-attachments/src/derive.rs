//! Derivation pipeline
//!
//! Identifies freshly stored content and, for images, produces one resized
//! variant per configured derivative. Resizes for one attachment run
//! concurrently and are awaited together.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use ia_core::{require_buffer, require_filename, ImageMetadata, ImagesConfig, ResizeOp};
use ia_images::{ImageError, ImageService};
use ia_storage::Attachment;
use tracing::{debug, error, info, instrument};

use crate::error::{AttachmentsError, AttachmentsResult};
use crate::scratch::ScratchSpace;

/// Outcome of a successful derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivation {
    /// Content was not a recognized image; the attachment keeps only its buffer
    NotAnImage,
    /// Content was identified and every derivative was produced
    Derived { derivatives: usize },
}

impl Derivation {
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Derived { .. })
    }
}

/// Identify and resize pipeline over an image engine and scratch space
pub struct Deriver {
    images: Arc<dyn ImageService>,
    scratch: ScratchSpace,
    config: Arc<ImagesConfig>,
}

impl Deriver {
    pub fn new(images: Arc<dyn ImageService>, config: Arc<ImagesConfig>) -> Self {
        Self {
            scratch: ScratchSpace::new(config.scratch_dir.clone()),
            images,
            config,
        }
    }

    pub fn images(&self) -> &Arc<dyn ImageService> {
        &self.images
    }

    pub fn scratch(&self) -> &ScratchSpace {
        &self.scratch
    }

    /// Identify `buffer` and derive its configured variants onto the
    /// attachment named `filename`
    ///
    /// Derivatives that finished before a failing resize stay on the
    /// attachment; the error is still returned.
    #[instrument(skip(self, attachments, buffer), fields(engine = self.images.name(), size = buffer.len()))]
    pub async fn identify_and_derive(
        &self,
        attachments: &mut [Attachment],
        filename: &str,
        buffer: &Bytes,
    ) -> AttachmentsResult<Derivation> {
        require_filename(filename)?;
        require_buffer(buffer)?;

        let attachment = attachments
            .iter_mut()
            .find(|a| a.filename == filename)
            .ok_or_else(|| AttachmentsError::MissingAttachment(filename.to_string()))?;

        let metadata = match self.identify(buffer).await {
            Ok(metadata) => metadata,
            Err(AttachmentsError::Image(ImageError::Unrecognized(reason))) => {
                info!(filename, %reason, "Not an image, skipping derivatives");
                return Ok(Derivation::NotAnImage);
            }
            Err(e) => {
                if e.is_engine_unavailable() {
                    error!(filename, error = %e, "Image engine unavailable");
                }
                return Err(e);
            }
        };
        attachment.metadata = Some(metadata.portable());

        let tasks = self
            .config
            .derivatives()
            .map(|(key, op)| async move { (key, self.resize(buffer, op).await) });
        let results = join_all(tasks).await;

        let mut derived = 0;
        let mut first_error = None;
        for (key, result) in results {
            match result {
                Ok(data) => {
                    debug!(filename, derivative = key, size = data.len(), "Derivative produced");
                    attachment.derivatives.insert(key.to_string(), data);
                    derived += 1;
                }
                Err(e) => {
                    error!(filename, derivative = key, error = %e, "Derivative failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(Derivation::Derived {
                derivatives: derived,
            }),
        }
    }

    async fn identify(&self, buffer: &[u8]) -> AttachmentsResult<ImageMetadata> {
        let source = self.scratch.write(buffer).await?;
        let identified = self.images.identify(source.path()).await;
        let released = source.release().await;

        let metadata = identified?;
        released?;
        debug!(format = %metadata.format, width = metadata.width, height = metadata.height, "Identified");
        Ok(metadata)
    }

    async fn resize(&self, buffer: &[u8], op: ResizeOp) -> AttachmentsResult<Bytes> {
        let source = self.scratch.write(buffer).await?;
        let target = self.scratch.reserve().await?;

        self.images.resize(source.path(), target.path(), op).await?;
        let data = target.read().await?;

        source.release().await?;
        target.release().await?;
        Ok(data)
    }
}

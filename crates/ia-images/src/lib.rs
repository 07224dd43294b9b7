//! # ia-images
//!
//! Image identification and resizing.
//!
//! ## Engines
//!
//! | Engine | Implementation |
//! |---|---|
//! | [`NativeImageService`] | `image` crate, decode and resample on the blocking pool |
//! | [`MagickImageService`] | GraphicsMagick `gm identify` / `gm convert` |
//!
//! Both operate on file paths and report failures through [`ImageError`],
//! whose variants distinguish non-image content from an unusable engine.

pub mod error;
pub mod geometry;
pub mod magick;
pub mod native;
pub mod service;

use std::sync::Arc;

use ia_core::config::ImageEngine;

pub use error::{ImageError, ImageResult};
pub use geometry::target_dimensions;
pub use magick::MagickImageService;
pub use native::NativeImageService;
pub use service::ImageService;

/// Build the configured engine
pub fn engine(kind: ImageEngine) -> Arc<dyn ImageService> {
    match kind {
        ImageEngine::Native => Arc::new(NativeImageService::new()),
        ImageEngine::Magick => Arc::new(MagickImageService::new()),
    }
}

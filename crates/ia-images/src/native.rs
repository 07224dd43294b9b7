//! Pure Rust image engine built on the `image` crate
//!
//! Decoding and resampling are CPU bound and run on the blocking pool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ia_core::{ImageMetadata, ResizeOp};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use serde_json::json;
use tracing::{debug, instrument};

use crate::error::{ImageError, ImageResult};
use crate::geometry::target_dimensions;
use crate::service::ImageService;

/// Image engine using the `image` crate
#[derive(Debug, Clone)]
pub struct NativeImageService {
    filter: FilterType,
}

impl Default for NativeImageService {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeImageService {
    pub fn new() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }

    /// Use a different resampling filter
    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }
}

type FileReader = ImageReader<std::io::BufReader<std::fs::File>>;

/// Open a file and sniff its format from the content
fn open(path: &Path) -> ImageResult<(FileReader, ImageFormat)> {
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    let format = reader
        .format()
        .ok_or_else(|| ImageError::Unrecognized("no known image signature".to_string()))?;
    Ok((reader, format))
}

fn format_name(format: ImageFormat) -> String {
    format!("{:?}", format).to_uppercase()
}

/// Errors while reading content that claims to be an image
fn decode_error(e: image::ImageError) -> ImageError {
    match e {
        image::ImageError::IoError(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData
            ) =>
        {
            ImageError::Unrecognized(e.to_string())
        }
        image::ImageError::IoError(e) => ImageError::Io(e),
        image::ImageError::Decoding(_) | image::ImageError::Unsupported(_) => {
            ImageError::Unrecognized(e.to_string())
        }
        other => ImageError::Processing(other.to_string()),
    }
}

fn processing_error(e: image::ImageError) -> ImageError {
    match e {
        image::ImageError::IoError(e) => ImageError::Io(e),
        other => ImageError::Processing(other.to_string()),
    }
}

fn identify_blocking(path: &Path) -> ImageResult<ImageMetadata> {
    let filesize = std::fs::metadata(path)?.len();
    let (reader, format) = open(path)?;
    let img = reader.decode().map_err(decode_error)?;
    let color = img.color();

    Ok(ImageMetadata {
        format: format_name(format),
        mime_type: format.to_mime_type().to_string(),
        width: img.width(),
        height: img.height(),
        filesize,
        color_type: format!("{:?}", color),
        has_alpha: color.has_alpha(),
        properties: Some(json!({
            "engine": "image-rs",
            "bits_per_pixel": color.bits_per_pixel(),
            "channels": color.channel_count(),
            "extensions": format.extensions_str(),
        })),
    })
}

fn resize_blocking(
    source: &Path,
    target: &Path,
    op: ResizeOp,
    filter: FilterType,
) -> ImageResult<()> {
    let (reader, format) = open(source)?;
    let img = reader.decode().map_err(processing_error)?;

    let (width, height) = target_dimensions(img.width(), img.height(), op);
    let resized = match op {
        ResizeOp::Thumbnail { .. } => img.resize_to_fill(width, height, filter),
        _ => img.resize_exact(width, height, filter),
    };

    // JPEG has no alpha channel
    let resized = if format == ImageFormat::Jpeg && resized.color().has_alpha() {
        DynamicImage::ImageRgb8(resized.to_rgb8())
    } else {
        resized
    };

    resized
        .save_with_format(target, format)
        .map_err(processing_error)
}

/// Run blocking engine work off the async runtime
async fn run_blocking<T, F>(f: F) -> ImageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ImageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ImageError::EngineUnavailable(format!("image worker failed: {}", e)))?
}

#[async_trait]
impl ImageService for NativeImageService {
    #[instrument(skip(self), fields(engine = "native"))]
    async fn identify(&self, path: &Path) -> ImageResult<ImageMetadata> {
        let path: PathBuf = path.to_path_buf();
        let metadata = run_blocking(move || identify_blocking(&path)).await?;
        debug!(
            format = %metadata.format,
            width = metadata.width,
            height = metadata.height,
            "Image identified"
        );
        Ok(metadata)
    }

    #[instrument(skip(self), fields(engine = "native", op = %op))]
    async fn resize(&self, source: &Path, target: &Path, op: ResizeOp) -> ImageResult<()> {
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        let filter = self.filter;
        run_blocking(move || resize_blocking(&source, &target, op, filter)).await
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "native"
    }
}

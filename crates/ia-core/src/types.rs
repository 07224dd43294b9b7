//! Common types used throughout the image attachment crates

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Document identity (addresses a document's attachments in the blob store)
pub type Id = Uuid;

/// Field name holding the identified image metadata
pub const METADATA_FIELD: &str = "metadata";

/// Field name holding the original attachment content
pub const CONTENT_FIELD: &str = "content";

/// Field names no derivative or extra key may use
pub const RESERVED_FIELDS: &[&str] = &[METADATA_FIELD, CONTENT_FIELD, "filename"];

/// Structured description of an identified image
///
/// Serialized with PascalCase keys (`Format`, `Width`, `Filesize`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageMetadata {
    /// Format name as reported by the engine (e.g. "JPEG")
    pub format: String,
    /// MIME type of the format
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    /// Size of the identified source in bytes
    pub filesize: u64,
    /// Color model (e.g. "Rgb8", "sRGB")
    pub color_type: String,
    pub has_alpha: bool,
    /// Engine-specific details; not portable across engine versions or locales
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
}

impl ImageMetadata {
    /// Strip engine-internal properties so the stored metadata stays stable
    pub fn portable(mut self) -> Self {
        self.properties = None;
        self
    }

    /// Width divided by height
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }
}

/// How a derivative is produced from the source image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ResizeOp {
    /// Crop-to-fill with centered gravity to exactly `width` x `height`
    Thumbnail { width: u32, height: u32 },
    /// Stretch to exactly `width` x `height`, ignoring aspect ratio
    Exact { width: u32, height: u32 },
    /// Scale to `width`, preserving aspect ratio
    Width { width: u32 },
    /// Scale to `height`, preserving aspect ratio
    Height { height: u32 },
}

impl ResizeOp {
    /// Engine-agnostic geometry string, e.g. `256x256^`
    pub fn geometry(&self) -> String {
        match self {
            Self::Thumbnail { width, height } => format!("{}x{}^", width, height),
            Self::Exact { width, height } => format!("{}x{}!", width, height),
            Self::Width { width } => format!("{}x", width),
            Self::Height { height } => format!("x{}", height),
        }
    }
}

impl std::fmt::Display for ResizeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.geometry())
    }
}

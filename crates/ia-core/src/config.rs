//! Configuration types and loading
//!
//! The configuration is built once at setup time and shared read-only by
//! every attachment operation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::types::{ResizeOp, METADATA_FIELD, RESERVED_FIELDS};

/// GridFS-compatible default chunk size (255 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// Image attachment configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Extra caller-defined fields stored with each attachment
    pub keys: Vec<String>,
    /// Derivative key -> resize specification
    pub resize: BTreeMap<String, DerivativeSpec>,
    /// Root directory of the local blob storage
    pub storage_path: PathBuf,
    /// Directory for scratch artifacts handed to the image engine
    pub scratch_dir: PathBuf,
    /// Blob chunk size in bytes
    pub chunk_size: usize,
    /// Which image engine to use
    pub engine: ImageEngine,
}

/// Resize specification for one derivative
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DerivativeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default)]
    pub thumbnail: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImageEngine {
    /// Pure Rust decoding and resampling
    #[default]
    Native,
    /// GraphicsMagick `gm` binary
    Magick,
}

impl DerivativeSpec {
    pub fn width(width: u32) -> Self {
        Self {
            width: Some(width),
            ..Self::default()
        }
    }

    pub fn height(height: u32) -> Self {
        Self {
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn exact(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            thumbnail: false,
        }
    }

    pub fn thumbnail(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            thumbnail: true,
        }
    }

    /// Resolve the resize operation; `None` when the entry is inert
    ///
    /// A zero dimension counts as unset.
    pub fn op(&self) -> Option<ResizeOp> {
        let width = self.width.filter(|w| *w > 0);
        let height = self.height.filter(|h| *h > 0);

        match (width, height) {
            (Some(width), Some(height)) if self.thumbnail => {
                Some(ResizeOp::Thumbnail { width, height })
            }
            (Some(width), Some(height)) => Some(ResizeOp::Exact { width, height }),
            (Some(width), None) => Some(ResizeOp::Width { width }),
            (None, Some(height)) => Some(ResizeOp::Height { height }),
            (None, None) => None,
        }
    }
}

impl std::str::FromStr for ImageEngine {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "rust" => Ok(Self::Native),
            "magick" | "gm" | "graphicsmagick" => Ok(Self::Magick),
            other => Err(ConfigError::InvalidValue {
                key: "IA_IMAGE_ENGINE".to_string(),
                message: format!("unknown engine '{}'", other),
            }),
        }
    }
}

impl Default for ImagesConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            keys: vec![],
            resize: BTreeMap::new(),
            storage_path: tmp.join("image-attachments"),
            scratch_dir: tmp.join("image-attachments-scratch"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            engine: ImageEngine::default(),
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("Field name is reserved: {0}")]
    ReservedKey(String),
    #[error("Field name configured twice: {0}")]
    DuplicateKey(String),
}

impl ImagesConfig {
    /// Add an extra caller-defined field
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// Add a derivative
    pub fn with_derivative(mut self, key: impl Into<String>, spec: DerivativeSpec) -> Self {
        self.resize.insert(key.into(), spec);
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn with_scratch_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_dir = path.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(keys) = std::env::var("IA_KEYS") {
            config.keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }

        // IA_RESIZE='{"small":{"width":256,"height":256,"thumbnail":true}}'
        if let Ok(resize) = std::env::var("IA_RESIZE") {
            config.resize =
                serde_json::from_str(&resize).map_err(|e| ConfigError::InvalidValue {
                    key: "IA_RESIZE".to_string(),
                    message: e.to_string(),
                })?;
        }

        if let Ok(path) = std::env::var("IA_STORAGE_PATH") {
            config.storage_path = path.into();
        }
        if let Ok(path) = std::env::var("IA_SCRATCH_DIR") {
            config.scratch_dir = path.into();
        }
        if let Ok(size) = std::env::var("IA_CHUNK_SIZE") {
            config.chunk_size = size.parse().map_err(|_| ConfigError::InvalidValue {
                key: "IA_CHUNK_SIZE".to_string(),
                message: format!("'{}' is not a byte count", size),
            })?;
        }
        if let Ok(engine) = std::env::var("IA_IMAGE_ENGINE") {
            config.engine = engine.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check field names and sizes
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "chunk_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for key in self.resize.keys().chain(self.keys.iter()) {
            if key.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "keys".to_string(),
                    message: "field names must not be empty".to_string(),
                });
            }
            if key.contains('/') || key.contains('\\') || key.contains("..") {
                return Err(ConfigError::InvalidValue {
                    key: "keys".to_string(),
                    message: format!("field name '{}' must not contain path separators", key),
                });
            }
            if RESERVED_FIELDS.contains(&key.as_str()) {
                return Err(ConfigError::ReservedKey(key.clone()));
            }
            if !seen.insert(key.as_str()) {
                return Err(ConfigError::DuplicateKey(key.clone()));
            }
        }

        for (key, spec) in &self.resize {
            if spec.op().is_none() {
                tracing::warn!(derivative = %key, "Derivative has no width or height, ignoring");
            }
        }

        Ok(())
    }

    /// Derivatives that produce output, in key order
    pub fn derivatives(&self) -> impl Iterator<Item = (&str, ResizeOp)> {
        self.resize
            .iter()
            .filter_map(|(key, spec)| spec.op().map(|op| (key.as_str(), op)))
    }

    /// Keys of derivatives that produce output
    pub fn derivative_keys(&self) -> Vec<String> {
        self.derivatives().map(|(key, _)| key.to_string()).collect()
    }

    /// Fields the attachment store allocates: metadata, derivatives, extras
    pub fn store_fields(&self) -> Vec<String> {
        let mut fields = vec![METADATA_FIELD.to_string()];
        fields.extend(self.resize.keys().cloned());
        fields.extend(self.keys.iter().cloned());
        fields
    }
}

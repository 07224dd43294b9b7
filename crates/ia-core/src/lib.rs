//! # ia-core
//!
//! Core types and configuration shared by the image attachment crates.
//!
//! This crate provides the foundational building blocks used across all other crates:
//! - Argument validation errors
//! - Document identifiers and image metadata
//! - Resize operations derived from the derivative configuration
//! - Setup-time configuration (`ImagesConfig`)

pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigError, DerivativeSpec, ImageEngine, ImagesConfig};
pub use error::*;
pub use types::*;

//! Validation errors for required arguments
//!
//! Reported immediately by every operation, never retried.

use thiserror::Error;

/// Missing caller argument
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required argument: {0}")]
    Missing(&'static str),
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Require a non-empty attachment filename
pub fn require_filename(filename: &str) -> ValidationResult<()> {
    if filename.trim().is_empty() {
        return Err(ValidationError::Missing("filename"));
    }
    Ok(())
}

/// Require a non-empty content buffer
pub fn require_buffer(buffer: &[u8]) -> ValidationResult<()> {
    if buffer.is_empty() {
        return Err(ValidationError::Missing("buffer"));
    }
    Ok(())
}

//! Document and Attachment Model

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ia_core::{Id, ImageMetadata};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunks::BlobManifest;

/// A document owning an ordered list of attachments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Id,
    pub attachments: Vec<Attachment>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create a document with a fresh identity
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Id) -> Self {
        Self {
            id,
            attachments: Vec::new(),
        }
    }

    /// Position of the first attachment with `filename`
    pub fn position(&self, filename: &str) -> Option<usize> {
        self.attachments.iter().position(|a| a.filename == filename)
    }

    pub fn attachment(&self, filename: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.filename == filename)
    }

    pub fn attachment_mut(&mut self, filename: &str) -> Option<&mut Attachment> {
        self.attachments.iter_mut().find(|a| a.filename == filename)
    }

    pub fn filenames(&self) -> Vec<&str> {
        self.attachments.iter().map(|a| a.filename.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }
}

/// One named binary item belonging to a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Unique within the document's attachment list
    pub filename: String,
    /// Original content; absent after a partial load
    #[serde(skip)]
    pub buffer: Option<Bytes>,
    /// Identified image metadata; absent for non-images
    pub metadata: Option<ImageMetadata>,
    /// Derivative key -> resized bytes
    #[serde(skip)]
    pub derivatives: BTreeMap<String, Bytes>,
    /// Caller-defined fields
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
    /// Size of the original content in bytes
    pub filesize: u64,
    /// MIME content type guessed from the filename
    pub content_type: String,
    /// SHA256 digest of the original content
    pub digest: String,
    pub uploaded_at: DateTime<Utc>,
}

impl Attachment {
    /// Create an attachment from freshly stored content
    pub fn new(filename: impl Into<String>, buffer: Bytes, manifest: &BlobManifest) -> Self {
        Self {
            filename: filename.into(),
            buffer: Some(buffer),
            metadata: None,
            derivatives: BTreeMap::new(),
            extra: BTreeMap::new(),
            filesize: manifest.length,
            content_type: manifest.content_type.clone(),
            digest: manifest.digest.clone(),
            uploaded_at: manifest.uploaded_at,
        }
    }

    /// Replace the content, dropping everything derived from the old one
    pub fn replace_content(&mut self, buffer: Bytes, manifest: &BlobManifest) {
        self.buffer = Some(buffer);
        self.metadata = None;
        self.derivatives.clear();
        self.filesize = manifest.length;
        self.content_type = manifest.content_type.clone();
        self.digest = manifest.digest.clone();
        self.uploaded_at = manifest.uploaded_at;
    }

    /// Check if this attachment was identified as an image
    pub fn is_image(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn derivative(&self, key: &str) -> Option<&Bytes> {
        self.derivatives.get(key)
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.extra.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(data: &[u8], content_type: &str) -> BlobManifest {
        BlobManifest {
            length: data.len() as u64,
            chunk_size: 4,
            chunks: data.len().div_ceil(4),
            digest: crate::chunks::digest(data),
            content_type: content_type.to_string(),
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_attachment_creation() {
        let data = Bytes::from("%PDF-1.4");
        let attachment = Attachment::new("license.pdf", data.clone(), &manifest(&data, "application/pdf"));

        assert_eq!(attachment.filename, "license.pdf");
        assert_eq!(attachment.filesize, 8);
        assert_eq!(attachment.buffer, Some(data));
        assert!(!attachment.is_image());
    }

    #[test]
    fn test_replace_content_clears_derived_fields() {
        let data = Bytes::from("old");
        let mut attachment = Attachment::new("a.jpg", data.clone(), &manifest(&data, "image/jpeg"));
        attachment.derivatives.insert("small".into(), Bytes::from("s"));
        attachment.set_extra("licensed", serde_json::json!(true));

        let new = Bytes::from("newer");
        attachment.replace_content(new.clone(), &manifest(&new, "image/jpeg"));

        assert_eq!(attachment.buffer, Some(new));
        assert_eq!(attachment.filesize, 5);
        assert!(attachment.derivatives.is_empty());
        assert_eq!(attachment.extra["licensed"], serde_json::json!(true));
    }

    #[test]
    fn test_document_lookup() {
        let mut doc = Document::new();
        let data = Bytes::from("x");
        doc.attachments
            .push(Attachment::new("a.txt", data.clone(), &manifest(&data, "text/plain")));
        doc.attachments
            .push(Attachment::new("b.txt", data.clone(), &manifest(&data, "text/plain")));

        assert_eq!(doc.position("b.txt"), Some(1));
        assert!(doc.attachment("c.txt").is_none());
        assert_eq!(doc.filenames(), vec!["a.txt", "b.txt"]);

        doc.attachment_mut("a.txt").unwrap().set_extra("k", serde_json::json!(1));
        assert_eq!(doc.attachment("a.txt").unwrap().extra["k"], 1);
    }

    #[test]
    fn test_serialized_record_omits_buffers() {
        let data = Bytes::from("x");
        let mut attachment = Attachment::new("a.txt", data.clone(), &manifest(&data, "text/plain"));
        attachment.derivatives.insert("small".into(), Bytes::from("s"));

        let json = serde_json::to_value(&attachment).unwrap();
        assert!(json.get("buffer").is_none());
        assert!(json.get("derivatives").is_none());
        assert_eq!(json["filename"], "a.txt");
    }
}

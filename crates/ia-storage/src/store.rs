//! Attachment Store
//!
//! Persists the binary fields of a document's attachments in chunked blob
//! storage, addressed by `<document id>/<hex(filename)>/<field>`. The
//! attachment list itself belongs to the in-memory document.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ia_core::{
    require_buffer, require_filename, Id, ImageMetadata, ImagesConfig, ValidationError,
    CONTENT_FIELD, METADATA_FIELD,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Storage, StorageError};
use crate::chunks::ChunkedBlobs;
use crate::model::{Attachment, Document};

/// Attachment store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Attachment not found: {0}")]
    NotFound(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Serialization error in field {field}: {source}")]
    Serialization {
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Attachment store trait
///
/// Every operation mutates the given document in place.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Store new content and append it to the document's attachments
    async fn add(&self, doc: &mut Document, filename: &str, buffer: Bytes) -> StoreResult<()>;

    /// Replace the content of an existing attachment
    async fn update(&self, doc: &mut Document, filename: &str, buffer: Bytes) -> StoreResult<()>;

    /// Release all stored fields and drop the attachment from the document
    async fn remove(&self, doc: &mut Document, filename: &str) -> StoreResult<()>;

    /// Load content and every configured field of all attachments
    async fn load_all(&self, doc: &mut Document) -> StoreResult<()>;

    /// Load configured fields of all attachments, without content
    async fn load_partial(&self, doc: &mut Document) -> StoreResult<()>;

    /// Load content and every configured field of one attachment
    async fn load_single(&self, doc: &mut Document, filename: &str) -> StoreResult<()>;

    /// Load configured fields of one attachment, without content
    async fn load_single_partial(&self, doc: &mut Document, filename: &str) -> StoreResult<()>;

    /// Persist metadata, derivative and extra fields held in memory
    ///
    /// Metadata and derivatives missing in memory are left untouched in the
    /// store: a document rebuilt from its record carries neither. Stale ones
    /// are dropped by `add`, `update` and `remove`. Extra fields travel with
    /// the record, so a missing extra field is removed.
    async fn save(&self, doc: &Document) -> StoreResult<()>;
}

/// Attachment store backed by chunked blobs
pub struct GridAttachmentStore<S: Storage> {
    blobs: ChunkedBlobs<S>,
    /// Derivative field names
    derivative_keys: Vec<String>,
    /// Caller-defined field names
    extra_keys: Vec<String>,
    /// Every allocated field, metadata first
    fields: Vec<String>,
}

impl<S: Storage> GridAttachmentStore<S> {
    pub fn new(storage: Arc<S>, config: &ImagesConfig) -> Self {
        Self {
            blobs: ChunkedBlobs::new(storage, config.chunk_size),
            derivative_keys: config.resize.keys().cloned().collect(),
            extra_keys: config.keys.clone(),
            fields: config.store_fields(),
        }
    }

    pub fn blobs(&self) -> &ChunkedBlobs<S> {
        &self.blobs
    }

    /// All field names allocated per attachment, metadata first
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn field_key(doc_id: &Id, filename: &str, field: &str) -> String {
        format!("{}/{}/{}", doc_id, hex::encode(filename.as_bytes()), field)
    }

    fn guess_content_type(filename: &str) -> String {
        mime_guess::from_path(filename)
            .first_or_octet_stream()
            .to_string()
    }

    async fn read_optional(&self, key: &str) -> StoreResult<Option<Bytes>> {
        match self.blobs.read(key).await {
            Ok(data) => Ok(Some(data)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: serde::Serialize>(
        &self,
        key: &str,
        field: &str,
        value: &T,
    ) -> StoreResult<()> {
        let raw = serde_json::to_vec(value).map_err(|source| StoreError::Serialization {
            field: field.to_string(),
            source,
        })?;
        self.blobs
            .write(key, Bytes::from(raw), "application/json")
            .await?;
        Ok(())
    }

    /// Drop stored metadata and derivatives, which describe replaced content
    async fn clear_derived(&self, doc_id: &Id, filename: &str) -> StoreResult<()> {
        let derived = std::iter::once(METADATA_FIELD)
            .chain(self.derivative_keys.iter().map(String::as_str));
        for field in derived {
            self.blobs
                .remove(&Self::field_key(doc_id, filename, field))
                .await?;
        }
        Ok(())
    }

    async fn load_into(
        &self,
        doc_id: &Id,
        attachment: &mut Attachment,
        with_content: bool,
    ) -> StoreResult<()> {
        let filename = attachment.filename.clone();

        attachment.buffer = if with_content {
            Some(
                self.blobs
                    .read(&Self::field_key(doc_id, &filename, CONTENT_FIELD))
                    .await?,
            )
        } else {
            None
        };

        let metadata_key = Self::field_key(doc_id, &filename, METADATA_FIELD);
        attachment.metadata = match self.read_optional(&metadata_key).await? {
            Some(raw) => Some(serde_json::from_slice::<ImageMetadata>(&raw).map_err(
                |source| StoreError::Serialization {
                    field: METADATA_FIELD.to_string(),
                    source,
                },
            )?),
            None => None,
        };

        let mut derivatives = BTreeMap::new();
        for key in &self.derivative_keys {
            let field_key = Self::field_key(doc_id, &filename, key);
            if let Some(data) = self.read_optional(&field_key).await? {
                derivatives.insert(key.clone(), data);
            }
        }
        attachment.derivatives = derivatives;

        for key in &self.extra_keys {
            let field_key = Self::field_key(doc_id, &filename, key);
            match self.read_optional(&field_key).await? {
                Some(raw) => {
                    let value = serde_json::from_slice(&raw).map_err(|source| {
                        StoreError::Serialization {
                            field: key.clone(),
                            source,
                        }
                    })?;
                    attachment.extra.insert(key.clone(), value);
                }
                None => {
                    attachment.extra.remove(key);
                }
            }
        }

        Ok(())
    }

    async fn save_attachment(&self, doc_id: &Id, attachment: &Attachment) -> StoreResult<()> {
        let filename = attachment.filename.as_str();

        if let Some(metadata) = &attachment.metadata {
            let metadata_key = Self::field_key(doc_id, filename, METADATA_FIELD);
            self.write_json(&metadata_key, METADATA_FIELD, metadata)
                .await?;
        }

        for key in &self.derivative_keys {
            if let Some(data) = attachment.derivatives.get(key) {
                let field_key = Self::field_key(doc_id, filename, key);
                self.blobs
                    .write(&field_key, data.clone(), &attachment.content_type)
                    .await?;
            }
        }
        for key in attachment.derivatives.keys() {
            if !self.derivative_keys.contains(key) {
                warn!(filename, field = %key, "Derivative not configured, not saved");
            }
        }

        for key in &self.extra_keys {
            let field_key = Self::field_key(doc_id, filename, key);
            match attachment.extra.get(key) {
                Some(value) => self.write_json(&field_key, key, value).await?,
                None => {
                    self.blobs.remove(&field_key).await?;
                }
            }
        }
        for key in attachment.extra.keys() {
            if !self.extra_keys.contains(key) {
                warn!(filename, field = %key, "Extra field not configured, not saved");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<S: Storage> AttachmentStore for GridAttachmentStore<S> {
    #[instrument(skip(self, doc, buffer), fields(doc_id = %doc.id, size = buffer.len()))]
    async fn add(&self, doc: &mut Document, filename: &str, buffer: Bytes) -> StoreResult<()> {
        require_filename(filename)?;
        require_buffer(&buffer)?;

        let key = Self::field_key(&doc.id, filename, CONTENT_FIELD);
        let manifest = self
            .blobs
            .write(&key, buffer.clone(), &Self::guess_content_type(filename))
            .await?;

        match doc.position(filename) {
            Some(pos) => {
                // Same name again: replace in place so filenames stay unique
                warn!(filename, "Attachment already exists, replacing content");
                self.clear_derived(&doc.id, filename).await?;
                doc.attachments[pos].replace_content(buffer, &manifest);
            }
            None => {
                doc.attachments
                    .push(Attachment::new(filename, buffer, &manifest));
            }
        }

        info!(filename, size = manifest.length, "Attachment added");
        Ok(())
    }

    #[instrument(skip(self, doc, buffer), fields(doc_id = %doc.id, size = buffer.len()))]
    async fn update(&self, doc: &mut Document, filename: &str, buffer: Bytes) -> StoreResult<()> {
        require_filename(filename)?;
        require_buffer(&buffer)?;

        let pos = doc
            .position(filename)
            .ok_or_else(|| StoreError::NotFound(filename.to_string()))?;

        let key = Self::field_key(&doc.id, filename, CONTENT_FIELD);
        let manifest = self
            .blobs
            .write(&key, buffer.clone(), &Self::guess_content_type(filename))
            .await?;
        self.clear_derived(&doc.id, filename).await?;

        doc.attachments[pos].replace_content(buffer, &manifest);

        info!(filename, size = manifest.length, "Attachment updated");
        Ok(())
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id))]
    async fn remove(&self, doc: &mut Document, filename: &str) -> StoreResult<()> {
        require_filename(filename)?;

        let pos = doc
            .position(filename)
            .ok_or_else(|| StoreError::NotFound(filename.to_string()))?;

        let fields = std::iter::once(CONTENT_FIELD).chain(self.fields.iter().map(String::as_str));
        for field in fields {
            self.blobs
                .remove(&Self::field_key(&doc.id, filename, field))
                .await?;
        }

        doc.attachments.remove(pos);

        info!(filename, "Attachment removed");
        Ok(())
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id, count = doc.attachments.len()))]
    async fn load_all(&self, doc: &mut Document) -> StoreResult<()> {
        let doc_id = doc.id;
        for attachment in doc.attachments.iter_mut() {
            self.load_into(&doc_id, attachment, true).await?;
        }
        debug!("Attachments loaded");
        Ok(())
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id, count = doc.attachments.len()))]
    async fn load_partial(&self, doc: &mut Document) -> StoreResult<()> {
        let doc_id = doc.id;
        for attachment in doc.attachments.iter_mut() {
            self.load_into(&doc_id, attachment, false).await?;
        }
        debug!("Attachments partially loaded");
        Ok(())
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id))]
    async fn load_single(&self, doc: &mut Document, filename: &str) -> StoreResult<()> {
        require_filename(filename)?;

        let doc_id = doc.id;
        let attachment = doc
            .attachment_mut(filename)
            .ok_or_else(|| StoreError::NotFound(filename.to_string()))?;
        self.load_into(&doc_id, attachment, true).await
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id))]
    async fn load_single_partial(&self, doc: &mut Document, filename: &str) -> StoreResult<()> {
        require_filename(filename)?;

        let doc_id = doc.id;
        let attachment = doc
            .attachment_mut(filename)
            .ok_or_else(|| StoreError::NotFound(filename.to_string()))?;
        self.load_into(&doc_id, attachment, false).await
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id, count = doc.attachments.len()))]
    async fn save(&self, doc: &Document) -> StoreResult<()> {
        for attachment in &doc.attachments {
            self.save_attachment(&doc.id, attachment).await?;
        }
        debug!("Attachment fields saved");
        Ok(())
    }
}

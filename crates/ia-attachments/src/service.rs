//! Image attachment operations on documents
//!
//! Every mutation runs under the document's write lock: the store step
//! completes before derivation starts, and the lock is released on every
//! exit path. Loads are not locked.

use std::sync::Arc;

use bytes::Bytes;
use ia_core::{require_buffer, require_filename, ConfigError, ImagesConfig};
use ia_images::ImageService;
use ia_storage::{AttachmentStore, Document, GridAttachmentStore, Storage};
use tracing::{info, instrument};

use crate::derive::{Derivation, Deriver};
use crate::error::AttachmentsResult;
use crate::lock::LockRegistry;

/// Image attachment facade over an attachment store and an image engine
pub struct ImageAttachments<St: AttachmentStore> {
    store: Arc<St>,
    deriver: Deriver,
    locks: LockRegistry,
    config: Arc<ImagesConfig>,
}

impl<S: Storage> ImageAttachments<GridAttachmentStore<S>> {
    /// Chunked blob store on `storage` and the engine named in `config`
    pub fn from_storage(storage: Arc<S>, config: ImagesConfig) -> Result<Self, ConfigError> {
        let store = Arc::new(GridAttachmentStore::new(storage, &config));
        let images = ia_images::engine(config.engine);
        Self::new(store, images, config)
    }
}

impl<St: AttachmentStore> ImageAttachments<St> {
    pub fn new(
        store: Arc<St>,
        images: Arc<dyn ImageService>,
        config: ImagesConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        info!(
            engine = images.name(),
            derivatives = ?config.derivative_keys(),
            keys = ?config.keys,
            "Image attachments configured"
        );

        Ok(Self {
            store,
            deriver: Deriver::new(images, config.clone()),
            locks: LockRegistry::new(),
            config,
        })
    }

    pub fn store(&self) -> &Arc<St> {
        &self.store
    }

    pub fn config(&self) -> &ImagesConfig {
        &self.config
    }

    pub fn images(&self) -> &Arc<dyn ImageService> {
        self.deriver.images()
    }

    /// Keys of derivatives produced for each image
    pub fn derivative_keys(&self) -> Vec<String> {
        self.config.derivative_keys()
    }

    /// Documents with a write in progress or waiting
    pub fn active_locks(&self) -> usize {
        self.locks.active()
    }

    /// Attach `buffer` as `filename` and derive its variants
    ///
    /// Content that is not an image is still attached and yields
    /// `Derivation::NotAnImage`.
    #[instrument(skip(self, doc, buffer), fields(doc_id = %doc.id, size = buffer.len()))]
    pub async fn add_image(
        &self,
        doc: &mut Document,
        filename: &str,
        buffer: Bytes,
    ) -> AttachmentsResult<Derivation> {
        require_filename(filename)?;
        require_buffer(&buffer)?;

        self.locks
            .with_write_lock(doc.id, self.store_and_derive(doc, filename, buffer, false))
            .await
    }

    /// Replace the content of an existing attachment and derive again
    #[instrument(skip(self, doc, buffer), fields(doc_id = %doc.id, size = buffer.len()))]
    pub async fn update_image(
        &self,
        doc: &mut Document,
        filename: &str,
        buffer: Bytes,
    ) -> AttachmentsResult<Derivation> {
        require_filename(filename)?;
        require_buffer(&buffer)?;

        self.locks
            .with_write_lock(doc.id, self.store_and_derive(doc, filename, buffer, true))
            .await
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id))]
    pub async fn remove_image(&self, doc: &mut Document, filename: &str) -> AttachmentsResult<()> {
        require_filename(filename)?;

        self.locks
            .with_write_lock(doc.id, self.store.remove(doc, filename))
            .await?;
        Ok(())
    }

    /// Critical section of add and update: store first, then derive
    async fn store_and_derive(
        &self,
        doc: &mut Document,
        filename: &str,
        buffer: Bytes,
        replace: bool,
    ) -> AttachmentsResult<Derivation> {
        if replace {
            self.store.update(doc, filename, buffer.clone()).await?;
        } else {
            self.store.add(doc, filename, buffer.clone()).await?;
        }
        self.deriver
            .identify_and_derive(&mut doc.attachments, filename, &buffer)
            .await
    }

    /// Load content and all fields of every attachment
    pub async fn load(&self, doc: &mut Document) -> AttachmentsResult<()> {
        self.store.load_all(doc).await?;
        Ok(())
    }

    /// Load metadata and derivatives of every attachment, without content
    pub async fn partial_load(&self, doc: &mut Document) -> AttachmentsResult<()> {
        self.store.load_partial(doc).await?;
        Ok(())
    }

    pub async fn load_single_image(
        &self,
        doc: &mut Document,
        filename: &str,
    ) -> AttachmentsResult<()> {
        require_filename(filename)?;
        self.store.load_single(doc, filename).await?;
        Ok(())
    }

    pub async fn partial_load_single_image(
        &self,
        doc: &mut Document,
        filename: &str,
    ) -> AttachmentsResult<()> {
        require_filename(filename)?;
        self.store.load_single_partial(doc, filename).await?;
        Ok(())
    }

    /// Persist metadata, derivatives and extra fields held in memory
    pub async fn save(&self, doc: &Document) -> AttachmentsResult<()> {
        self.store.save(doc).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttachmentsError;
    use async_trait::async_trait;
    use ia_core::DerivativeSpec;
    use ia_images::{MagickImageService, NativeImageService};
    use ia_storage::{MemoryStorage, StoreError, StoreResult};
    use image::imageops::FilterType;
    use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn encode(width: u32, height: u32, format: ImageFormat) -> Bytes {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, 200])
        }));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        Bytes::from(buf.into_inner())
    }

    fn jpeg(width: u32, height: u32) -> Bytes {
        encode(width, height, ImageFormat::Jpeg)
    }

    fn dimensions(data: &[u8]) -> (u32, u32) {
        image::load_from_memory(data).unwrap().dimensions()
    }

    fn pdf() -> Bytes {
        Bytes::from_static(b"%PDF-1.4\n1 0 obj << /Type /Pages /Count 3 >> endobj\n%%EOF")
    }

    fn engine() -> Arc<dyn ImageService> {
        Arc::new(NativeImageService::new().with_filter(FilterType::Triangle))
    }

    fn config(scratch: &Path) -> ImagesConfig {
        ImagesConfig::default()
            .with_scratch_dir(scratch)
            .with_chunk_size(4096)
            .with_key("license")
            .with_derivative("small", DerivativeSpec::exact(256, 256))
            .with_derivative("medium", DerivativeSpec::width(1600))
    }

    fn facade(config: ImagesConfig) -> ImageAttachments<GridAttachmentStore<MemoryStorage>> {
        let store = Arc::new(GridAttachmentStore::new(Arc::new(MemoryStorage::new()), &config));
        ImageAttachments::new(store, engine(), config).unwrap()
    }

    fn scratch_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    /// Document as the caller would persist it: no buffers, no derivatives
    fn reloaded(doc: &Document) -> Document {
        serde_json::from_str(&serde_json::to_string(doc).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_attachment_lifecycle() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(config(scratch.path()));
        let mut doc = Document::new();

        let outcome = attachments
            .add_image(&mut doc, "license.pdf", pdf())
            .await
            .unwrap();
        assert_eq!(outcome, Derivation::NotAnImage);
        assert_eq!(doc.len(), 1);
        assert!(doc.attachments[0].metadata.is_none());

        let outcome = attachments
            .add_image(&mut doc, "kitten.jpg", jpeg(64, 48))
            .await
            .unwrap();
        assert_eq!(outcome, Derivation::Derived { derivatives: 2 });
        assert_eq!(doc.len(), 2);
        let kitten = &doc.attachments[1];
        assert!(kitten.metadata.is_some());
        assert!(!kitten.derivative("small").unwrap().is_empty());
        assert!(!kitten.derivative("medium").unwrap().is_empty());
        let filesize_before = kitten.metadata.as_ref().unwrap().filesize;

        attachments
            .update_image(&mut doc, "kitten.jpg", jpeg(200, 150))
            .await
            .unwrap();
        let filesize_after = doc.attachments[1].metadata.as_ref().unwrap().filesize;
        assert_ne!(filesize_before, filesize_after);

        attachments.remove_image(&mut doc, "kitten.jpg").await.unwrap();
        attachments.load(&mut doc).await.unwrap();
        assert_eq!(doc.filenames(), vec!["license.pdf"]);
        assert_eq!(doc.attachments[0].buffer.as_ref().unwrap(), &pdf());

        assert_eq!(scratch_entries(scratch.path()), 0);
        assert_eq!(attachments.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_width_only_preserves_aspect() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(
            ImagesConfig::default()
                .with_scratch_dir(scratch.path())
                .with_derivative("half", DerivativeSpec::width(40))
                .with_derivative("short", DerivativeSpec::height(15)),
        );
        let mut doc = Document::new();

        attachments
            .add_image(&mut doc, "wide.png", encode(80, 30, ImageFormat::Png))
            .await
            .unwrap();

        let wide = doc.attachment("wide.png").unwrap();
        let source_ratio = wide.metadata.as_ref().unwrap().aspect_ratio();
        for key in ["half", "short"] {
            let (width, height) = dimensions(wide.derivative(key).unwrap());
            assert_eq!((width, height), (40, 15));
            assert!((width as f64 / height as f64 - source_ratio).abs() < 0.1);
        }
    }

    #[tokio::test]
    async fn test_save_after_reload_keeps_derivatives() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(config(scratch.path()));
        let mut doc = Document::new();

        attachments
            .add_image(&mut doc, "kitten.jpg", jpeg(64, 48))
            .await
            .unwrap();
        attachments.save(&doc).await.unwrap();

        let mut restored = reloaded(&doc);
        attachments
            .add_image(&mut restored, "license.pdf", pdf())
            .await
            .unwrap();
        attachments.save(&restored).await.unwrap();

        attachments.partial_load(&mut restored).await.unwrap();
        let kitten = restored.attachment("kitten.jpg").unwrap();
        assert!(kitten.metadata.is_some());
        assert!(!kitten.derivative("small").unwrap().is_empty());
        assert!(!kitten.derivative("medium").unwrap().is_empty());
        assert!(restored.attachment("license.pdf").unwrap().metadata.is_none());
    }

    #[tokio::test]
    async fn test_thumbnail_is_exact() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(
            ImagesConfig::default()
                .with_scratch_dir(scratch.path())
                .with_derivative("thumb", DerivativeSpec::thumbnail(24, 24))
                .with_derivative("stretched", DerivativeSpec::exact(10, 50)),
        );
        let mut doc = Document::new();

        attachments
            .add_image(&mut doc, "photo.jpg", jpeg(90, 30))
            .await
            .unwrap();

        let photo = doc.attachment("photo.jpg").unwrap();
        assert_eq!(dimensions(photo.derivative("thumb").unwrap()), (24, 24));
        assert_eq!(dimensions(photo.derivative("stretched").unwrap()), (10, 50));
    }

    #[tokio::test]
    async fn test_partial_load_omits_content() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(config(scratch.path()));
        let mut doc = Document::new();

        attachments
            .add_image(&mut doc, "kitten.jpg", jpeg(32, 32))
            .await
            .unwrap();
        doc.attachments[0].set_extra("license", serde_json::json!({"cc": "by-sa"}));
        attachments.save(&doc).await.unwrap();

        let mut restored = reloaded(&doc);
        attachments.partial_load(&mut restored).await.unwrap();

        let kitten = &restored.attachments[0];
        assert_eq!(kitten.filename, "kitten.jpg");
        assert!(kitten.buffer.is_none());
        assert!(kitten.metadata.is_some());
        assert!(!kitten.derivative("small").unwrap().is_empty());
        assert!(!kitten.derivative("medium").unwrap().is_empty());
        assert_eq!(kitten.extra["license"]["cc"], "by-sa");
    }

    #[tokio::test]
    async fn test_load_single_returns_original_bytes() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(config(scratch.path()));
        let mut doc = Document::new();
        let original = jpeg(50, 20);

        attachments
            .add_image(&mut doc, "kitten.jpg", original.clone())
            .await
            .unwrap();
        attachments
            .add_image(&mut doc, "license.pdf", pdf())
            .await
            .unwrap();
        attachments.save(&doc).await.unwrap();

        let mut restored = reloaded(&doc);
        attachments
            .load_single_image(&mut restored, "kitten.jpg")
            .await
            .unwrap();
        assert_eq!(restored.attachments[0].buffer.as_ref().unwrap(), &original);
        assert!(restored.attachments[1].buffer.is_none());

        attachments
            .partial_load_single_image(&mut restored, "kitten.jpg")
            .await
            .unwrap();
        assert!(restored.attachments[0].buffer.is_none());
        assert!(restored.attachments[0].is_image());

        let err = attachments
            .load_single_image(&mut restored, "missing.jpg")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_and_remove_missing() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(config(scratch.path()));
        let mut doc = Document::new();

        let err = attachments
            .update_image(&mut doc, "ghost.jpg", jpeg(8, 8))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = attachments
            .remove_image(&mut doc, "ghost.jpg")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(attachments.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_add_existing_filename_replaces() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(config(scratch.path()));
        let mut doc = Document::new();

        attachments
            .add_image(&mut doc, "kitten.jpg", jpeg(16, 16))
            .await
            .unwrap();
        attachments
            .add_image(&mut doc, "kitten.jpg", jpeg(40, 20))
            .await
            .unwrap();

        assert_eq!(doc.len(), 1);
        let metadata = doc.attachments[0].metadata.as_ref().unwrap();
        assert_eq!((metadata.width, metadata.height), (40, 20));
    }

    #[tokio::test]
    async fn test_validation() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(config(scratch.path()));
        let mut doc = Document::new();

        let err = attachments
            .add_image(&mut doc, "  ", jpeg(8, 8))
            .await
            .unwrap_err();
        assert!(matches!(err, AttachmentsError::Validation(_)));

        let err = attachments
            .add_image(&mut doc, "empty.jpg", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AttachmentsError::Validation(_)));
        assert!(doc.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_reserved_config() {
        let config = ImagesConfig::default().with_derivative("metadata", DerivativeSpec::width(10));
        let store = Arc::new(GridAttachmentStore::new(Arc::new(MemoryStorage::new()), &config));
        assert!(ImageAttachments::new(store, engine(), config).is_err());
    }

    #[tokio::test]
    async fn test_engine_unavailable_releases_lock() {
        let scratch = TempDir::new().unwrap();
        let config = config(scratch.path());
        let store = Arc::new(GridAttachmentStore::new(Arc::new(MemoryStorage::new()), &config));
        let images = Arc::new(MagickImageService::with_program("/nonexistent/gm"));
        let attachments = ImageAttachments::new(store, images, config).unwrap();
        let mut doc = Document::new();

        let err = attachments
            .add_image(&mut doc, "kitten.jpg", jpeg(8, 8))
            .await
            .unwrap_err();
        assert!(err.is_engine_unavailable());
        assert_eq!(attachments.active_locks(), 0);
        assert_eq!(scratch_entries(scratch.path()), 0);

        // A second write on the same document is not blocked
        let second = tokio::time::timeout(
            Duration::from_secs(5),
            attachments.add_image(&mut doc, "other.jpg", jpeg(8, 8)),
        )
        .await
        .unwrap();
        assert!(second.unwrap_err().is_engine_unavailable());
    }

    /// Store double that records the bracket of every mutation
    struct RecordingStore {
        inner: GridAttachmentStore<MemoryStorage>,
        events: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttachmentStore for RecordingStore {
        async fn add(&self, doc: &mut Document, filename: &str, buffer: Bytes) -> StoreResult<()> {
            self.record(format!("begin {}", filename));
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = self.inner.add(doc, filename, buffer).await;
            self.record(format!("end {}", filename));
            result
        }

        async fn update(&self, doc: &mut Document, filename: &str, buffer: Bytes) -> StoreResult<()> {
            self.inner.update(doc, filename, buffer).await
        }

        async fn remove(&self, doc: &mut Document, filename: &str) -> StoreResult<()> {
            self.record(format!("remove {}", filename));
            self.inner.remove(doc, filename).await
        }

        async fn load_all(&self, doc: &mut Document) -> StoreResult<()> {
            self.inner.load_all(doc).await
        }

        async fn load_partial(&self, doc: &mut Document) -> StoreResult<()> {
            self.inner.load_partial(doc).await
        }

        async fn load_single(&self, doc: &mut Document, filename: &str) -> StoreResult<()> {
            self.inner.load_single(doc, filename).await
        }

        async fn load_single_partial(&self, doc: &mut Document, filename: &str) -> StoreResult<()> {
            self.inner.load_single_partial(doc, filename).await
        }

        async fn save(&self, doc: &Document) -> StoreResult<()> {
            self.inner.save(doc).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_do_not_interleave() {
        let scratch = TempDir::new().unwrap();
        let config = config(scratch.path());
        let store = Arc::new(RecordingStore {
            inner: GridAttachmentStore::new(Arc::new(MemoryStorage::new()), &config),
            events: Mutex::new(Vec::new()),
        });
        let attachments = Arc::new(ImageAttachments::new(store.clone(), engine(), config).unwrap());

        // Two handles on the same document identity
        let doc = Document::new();
        let mut handles = Vec::new();
        for name in ["a.jpg", "b.pdf", "c.jpg", "d.pdf"] {
            let attachments = attachments.clone();
            let mut doc = doc.clone();
            let buffer = if name.ends_with(".pdf") { pdf() } else { jpeg(16, 16) };
            handles.push(tokio::spawn(async move {
                attachments.add_image(&mut doc, name, buffer).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let events = store.events();
        assert_eq!(events.len(), 8);
        for pair in events.chunks(2) {
            let begin = pair[0].strip_prefix("begin ").unwrap();
            let end = pair[1].strip_prefix("end ").unwrap();
            assert_eq!(begin, end, "interleaved mutations: {:?}", events);
        }
        assert_eq!(attachments.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_store_error_propagates() {
        let scratch = TempDir::new().unwrap();
        let attachments = facade(config(scratch.path()));
        let mut doc = Document::new();

        attachments
            .add_image(&mut doc, "kitten.jpg", jpeg(8, 8))
            .await
            .unwrap();
        // Content vanished behind the store's back
        attachments
            .store()
            .blobs()
            .remove(&format!("{}/{}/content", doc.id, hex::encode("kitten.jpg")))
            .await
            .unwrap();

        let err = attachments.load(&mut doc).await.unwrap_err();
        assert!(matches!(err, AttachmentsError::Store(StoreError::Storage(_))));
    }
}

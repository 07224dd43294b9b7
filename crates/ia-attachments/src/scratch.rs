//! Scratch files for the image engine
//!
//! The engine works on paths, so every buffer it sees is first written to a
//! uniquely named file in the scratch directory. Each file is deleted once
//! its result has been read back.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory holding temporary engine inputs and outputs
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    dir: PathBuf,
}

impl ScratchSpace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh scratch identifier; unique per call
    pub fn new_id() -> Uuid {
        Uuid::new_v4()
    }

    pub fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Write `data` to a new scratch file
    pub async fn write(&self, data: &[u8]) -> io::Result<ScratchFile> {
        let file = self.reserve().await?;
        tokio::fs::write(&file.path, data).await?;
        debug!(path = %file.path.display(), size = data.len(), "Scratch file written");
        Ok(file)
    }

    /// Claim a new scratch path without creating the file
    pub async fn reserve(&self) -> io::Result<ScratchFile> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let id = Self::new_id();
        Ok(ScratchFile {
            path: self.path_for(&id),
            id,
            armed: true,
        })
    }
}

/// A scratch file owned by one pipeline step
///
/// `release` deletes it and reports failure. A file dropped without release
/// is removed on a best-effort basis.
#[derive(Debug)]
pub struct ScratchFile {
    id: Uuid,
    path: PathBuf,
    armed: bool,
}

impl ScratchFile {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> io::Result<Bytes> {
        tokio::fs::read(&self.path).await.map(Bytes::from)
    }

    /// Delete the file
    pub async fn release(mut self) -> io::Result<()> {
        self.armed = false;
        tokio::fs::remove_file(&self.path).await?;
        debug!(path = %self.path.display(), "Scratch file released");
        Ok(())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Scratch file discarded"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to discard scratch file"),
        }
    }
}

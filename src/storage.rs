//! # Audio Storage Collaborator
//!
//! Boundary to the object store holding reference and practice recordings.
//! The orchestrator only ever sees this trait: `exists`, a streamed
//! `download_to_local`, and `delete`.
//!
//! Downloads land in `TempAudioFile` guards. The guard owns the scratch
//! file and removes it when dropped, so every local file the pipeline
//! creates disappears on success, failure, and cancellation alike.
//!
//! A filesystem-backed implementation ships here for tests and single-node
//! deploys; the production object store lives behind the same trait.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A downloaded audio file in scratch storage, deleted on drop.
#[derive(Debug)]
pub struct TempAudioFile {
    inner: tempfile::NamedTempFile,
}

impl TempAudioFile {
    pub fn path(&self) -> &Path {
        self.inner.path()
    }
}

/// Object-store operations the analysis pipeline consumes.
#[async_trait]
pub trait AudioStorage: Send + Sync {
    /// Whether the object exists in the store.
    async fn exists(&self, path: &str) -> PipelineResult<bool>;

    /// Stream the object into local scratch storage.
    ///
    /// A missing object is a permanent `FileAccess` error (the task will not
    /// be retried); transport failures are transient.
    async fn download_to_local(&self, path: &str) -> PipelineResult<TempAudioFile>;

    /// Remove the object from the store.
    async fn delete(&self, path: &str) -> PipelineResult<()>;
}

/// Filesystem-backed storage rooted at a directory.
pub struct LocalAudioStorage {
    root: PathBuf,
}

impl LocalAudioStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl AudioStorage for LocalAudioStorage {
    async fn exists(&self, path: &str) -> PipelineResult<bool> {
        let full = self.resolve(path);
        tokio::fs::try_exists(&full)
            .await
            .map_err(|e| PipelineError::FileAccess {
                path: path.to_string(),
                message: e.to_string(),
                permanent: false,
            })
    }

    async fn download_to_local(&self, path: &str) -> PipelineResult<TempAudioFile> {
        if !self.exists(path).await? {
            return Err(PipelineError::FileAccess {
                path: path.to_string(),
                message: "object does not exist".to_string(),
                permanent: true,
            });
        }

        let full = self.resolve(path);
        let suffix = full
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_else(|| ".wav".to_string());
        let source_label = path.to_string();

        // Streamed copy on a blocking thread; temp-file creation and IO are
        // synchronous APIs.
        let inner = tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile, std::io::Error> {
            let mut reader = std::fs::File::open(&full)?;
            let mut temp = tempfile::Builder::new().suffix(&suffix).tempfile()?;
            std::io::copy(&mut reader, temp.as_file_mut())?;
            temp.as_file_mut().sync_all()?;
            Ok(temp)
        })
        .await
        .map_err(|e| PipelineError::FileAccess {
            path: source_label.clone(),
            message: format!("download task aborted: {}", e),
            permanent: false,
        })?
        .map_err(|e| PipelineError::FileAccess {
            path: source_label.clone(),
            message: e.to_string(),
            permanent: false,
        })?;

        debug!(object = %source_label, local = %inner.path().display(), "Downloaded audio to scratch file");
        Ok(TempAudioFile { inner })
    }

    async fn delete(&self, path: &str) -> PipelineResult<()> {
        let full = self.resolve(path);
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| PipelineError::FileAccess {
                path: path.to_string(),
                message: e.to_string(),
                permanent: false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_file(name: &str, contents: &[u8]) -> (tempfile::TempDir, LocalAudioStorage) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(name), contents).unwrap();
        let storage = LocalAudioStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn test_exists() {
        let (_dir, storage) = storage_with_file("a.wav", b"audio");
        assert!(storage.exists("a.wav").await.unwrap());
        assert!(!storage.exists("missing.wav").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_copies_contents_and_cleans_up() {
        let (_dir, storage) = storage_with_file("a.wav", b"audio-bytes");

        let local_path = {
            let temp = storage.download_to_local("a.wav").await.unwrap();
            let contents = std::fs::read(temp.path()).unwrap();
            assert_eq!(contents, b"audio-bytes");
            temp.path().to_path_buf()
        };

        // The guard dropped at the end of the block and took the file with it.
        assert!(!local_path.exists());
    }

    #[tokio::test]
    async fn test_missing_object_is_permanent() {
        let (_dir, storage) = storage_with_file("a.wav", b"audio");
        let err = storage.download_to_local("missing.wav").await.unwrap_err();
        match err {
            PipelineError::FileAccess { permanent, .. } => assert!(permanent),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_delete() {
        let (dir, storage) = storage_with_file("a.wav", b"audio");
        storage.delete("a.wav").await.unwrap();
        assert!(!dir.path().join("a.wav").exists());
    }
}

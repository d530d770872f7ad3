//! Upload storage: persists incoming audio before a job is created.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};
use uuid::Uuid;

/// Extension used when the client's file name carries none.
pub const DEFAULT_EXTENSION: &str = "m4a";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to create upload directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write upload {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove upload {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes uploads once, as `<uuid-v7>.<ext>` under a single directory.
/// Files are never modified afterwards, only discarded when no job was
/// created for them.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[instrument(skip(self, bytes), fields(dir = %self.dir.display(), len = bytes.len()), err)]
    pub async fn save(&self, original_name: &str, bytes: &[u8]) -> Result<PathBuf, UploadError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| UploadError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let path = self
            .dir
            .join(format!("{}.{}", Uuid::now_v7(), extension_of(original_name)));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| UploadError::Write {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "upload stored");
        Ok(path)
    }

    /// Delete an upload that never made it into a job.
    pub async fn discard(&self, path: &Path) -> Result<(), UploadError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|source| UploadError::Remove {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), "upload discarded");
        Ok(())
    }
}

/// Extension of the client-supplied name, restricted to a safe charset so
/// the stored name can't escape the upload directory.
fn extension_of(original_name: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_falls_back_to_m4a() {
        assert_eq!(extension_of("meeting.WAV"), "wav");
        assert_eq!(extension_of("voice"), "m4a");
        assert_eq!(extension_of(""), "m4a");
        assert_eq!(extension_of("weird.m/4a"), "m4a");
    }

    #[tokio::test]
    async fn save_creates_the_directory_and_writes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = UploadStore::new(tmp.path().join("nested/uploads"));

        let first = store.save("note.mp3", b"abc").await.unwrap();
        let second = store.save("note.mp3", b"def").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(first.parent(), Some(store.dir()));
        assert_eq!(first.extension().and_then(|e| e.to_str()), Some("mp3"));
        assert_eq!(tokio::fs::read(&first).await.unwrap(), b"abc");
        assert_eq!(tokio::fs::read(&second).await.unwrap(), b"def");
    }

    #[tokio::test]
    async fn discard_removes_the_file_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = UploadStore::new(tmp.path());

        let path = store.save("a.m4a", b"abc").await.unwrap();
        store.discard(&path).await.unwrap();
        assert!(!path.exists());

        let err = store.discard(&path).await.unwrap_err();
        assert!(matches!(err, UploadError::Remove { .. }));
    }

    #[tokio::test]
    async fn unwritable_directory_is_an_upload_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let store = UploadStore::new(blocker.join("uploads"));
        let err = store.save("a.m4a", b"abc").await.unwrap_err();
        assert!(matches!(err, UploadError::CreateDir { .. }));
    }
}

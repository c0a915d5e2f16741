//! Local file storage
//!
//! Attachments are addressed by `file://` URIs. Downloads land in the
//! files directory; attachments captured for upload live in the upload
//! directory until they have been sent.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use url::Url;

use crate::config::StorageConfig;
use crate::error::SyncError;

/// Local file storage consumed by the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Write downloaded bytes under `name`
    ///
    /// # Returns
    /// Local URI of the stored file
    async fn persist(&self, name: &str, bytes: Vec<u8>) -> Result<String, SyncError>;

    /// Move a captured file into the upload area
    ///
    /// # Returns
    /// Permanent local URI
    async fn move_to_upload_area(&self, path: &Path) -> Result<String, SyncError>;

    /// Read the file behind a local URI
    async fn read(&self, uri: &str) -> Result<Vec<u8>, SyncError>;
}

/// Name an attachment is sent under: the last path segment of its URI
///
/// The server does not need the device's directory layout.
pub fn attachment_name(uri: &str) -> Option<String> {
    let name = match Url::parse(uri) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string)),
        Err(_) => uri.rsplit(['/', '\\']).next().map(str::to_string),
    }?;

    let name = urlencoding::decode(&name)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(name);
    if name.is_empty() { None } else { Some(name) }
}

/// File store rooted in two local directories
pub struct LocalFileStore {
    files_dir: PathBuf,
    upload_dir: PathBuf,
}

impl LocalFileStore {
    /// Create the store, creating both directories if missing
    pub fn new(config: &StorageConfig) -> Result<Self, SyncError> {
        for dir in [&config.files_dir, &config.upload_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                SyncError::Storage(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        Ok(Self {
            files_dir: config.files_dir.clone(),
            upload_dir: config.upload_dir.clone(),
        })
    }

    fn uri_for(path: &Path) -> Result<String, SyncError> {
        let absolute = std::path::absolute(path)
            .map_err(|e| SyncError::Storage(format!("cannot resolve {}: {}", path.display(), e)))?;
        Url::from_file_path(&absolute)
            .map(String::from)
            .map_err(|_| SyncError::Storage(format!("not a file path: {}", absolute.display())))
    }

    fn path_for(uri: &str) -> Result<PathBuf, SyncError> {
        match Url::parse(uri) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|_| SyncError::Storage(format!("invalid file URI: {}", uri))),
            Ok(url) => Err(SyncError::Storage(format!(
                "unsupported URI scheme {}: {}",
                url.scheme(),
                uri
            ))),
            Err(_) => Ok(PathBuf::from(uri)),
        }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn persist(&self, name: &str, bytes: Vec<u8>) -> Result<String, SyncError> {
        let file_name = attachment_name(name)
            .ok_or_else(|| SyncError::Storage(format!("invalid file name: {:?}", name)))?;
        let dir = self.files_dir.clone();
        let target = dir.join(&file_name);

        // Write to a temporary file first so readers never see a partial file
        let stored = tokio::task::spawn_blocking(move || -> Result<PathBuf, SyncError> {
            let mut temp = tempfile::NamedTempFile::new_in(&dir)
                .map_err(|e| SyncError::Storage(format!("temp file failed: {}", e)))?;
            temp.write_all(&bytes)
                .map_err(|e| SyncError::Storage(format!("write failed: {}", e)))?;
            temp.persist(&target)
                .map_err(|e| SyncError::Storage(format!("persist failed: {}", e.error)))?;
            Ok(target)
        })
        .await
        .map_err(|e| SyncError::Internal(e.into()))??;

        tracing::debug!(path = %stored.display(), "Attachment stored");
        Self::uri_for(&stored)
    }

    async fn move_to_upload_area(&self, path: &Path) -> Result<String, SyncError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| SyncError::Storage(format!("invalid file path: {}", path.display())))?;
        let target = self
            .upload_dir
            .join(format!("{}-{}", ulid::Ulid::new(), file_name));

        if tokio::fs::rename(path, &target).await.is_err() {
            // Cross-device moves fall back to copy + remove
            tokio::fs::copy(path, &target)
                .await
                .map_err(|e| SyncError::Storage(format!("copy failed: {}", e)))?;
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| SyncError::Storage(format!("remove failed: {}", e)))?;
        }

        Self::uri_for(&target)
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>, SyncError> {
        let path = Self::path_for(uri)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| SyncError::Storage(format!("cannot read {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> LocalFileStore {
        LocalFileStore::new(&StorageConfig {
            files_dir: temp_dir.path().join("files"),
            upload_dir: temp_dir.path().join("outbox"),
        })
        .unwrap()
    }

    #[test]
    fn attachment_name_is_last_segment() {
        assert_eq!(
            attachment_name("file:///data/outbox/01H-photo.jpg").as_deref(),
            Some("01H-photo.jpg")
        );
        assert_eq!(
            attachment_name("/sdcard/DCIM/photo.jpg").as_deref(),
            Some("photo.jpg")
        );
        assert_eq!(
            attachment_name("file:///data/my%20photo.jpg").as_deref(),
            Some("my photo.jpg")
        );
        assert_eq!(attachment_name("file:///data/outbox/"), None);
    }

    #[tokio::test]
    async fn persist_then_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let files = store(&temp_dir);

        let uri = files.persist("photo.jpg", b"jpeg".to_vec()).await.unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("/files/photo.jpg"));
        assert_eq!(files.read(&uri).await.unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn persist_strips_directories_from_name() {
        let temp_dir = TempDir::new().unwrap();
        let files = store(&temp_dir);

        let uri = files
            .persist("media/2024/photo.jpg", b"jpeg".to_vec())
            .await
            .unwrap();
        assert!(uri.ends_with("/files/photo.jpg"));
    }

    #[tokio::test]
    async fn move_to_upload_area_relocates_file() {
        let temp_dir = TempDir::new().unwrap();
        let files = store(&temp_dir);
        let captured = temp_dir.path().join("capture.png");
        std::fs::write(&captured, b"png").unwrap();

        let uri = files.move_to_upload_area(&captured).await.unwrap();
        assert!(!captured.exists());
        assert!(uri.contains("/outbox/"));
        assert!(uri.ends_with("-capture.png"));
        assert_eq!(files.read(&uri).await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn read_rejects_remote_uris() {
        let temp_dir = TempDir::new().unwrap();
        let files = store(&temp_dir);

        let error = files
            .read("https://example.org/photo.jpg")
            .await
            .expect_err("remote URIs are not local files");
        assert!(matches!(error, SyncError::Storage(_)));
    }
}

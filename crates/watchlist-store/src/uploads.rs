//! On-disk storage for accepted photos.

use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use watchlist_core::SourceImage;

const MAX_EXTENSION_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to store upload {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes uploads into one directory and names them uniquely.
pub struct UploadStore {
    dir: PathBuf,
    /// URL prefix records use to refer to stored files.
    public_prefix: String,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_prefix: public_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Persist `bytes` and return where they went.
    ///
    /// The extension comes from the client's file name when it has a sane one,
    /// else from `fallback_ext` (usually the sniffed format).
    pub fn save(
        &self,
        bytes: &[u8],
        original_name: Option<&str>,
        fallback_ext: Option<&str>,
    ) -> Result<SourceImage, UploadError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| UploadError::Write {
            path: self.dir.clone(),
            source,
        })?;

        let ext = original_name
            .and_then(|n| Path::new(n).extension())
            .and_then(|e| e.to_str())
            .filter(|e| is_safe_extension(e))
            .or(fallback_ext.filter(|e| is_safe_extension(e)));

        let filename = unique_name(ext);
        let path = self.dir.join(&filename);
        std::fs::write(&path, bytes).map_err(|source| UploadError::Write {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "upload stored");

        Ok(SourceImage {
            storage_path: format!("{}/{}", self.public_prefix, filename),
            filename,
        })
    }

    /// Local path of a stored upload.
    pub fn local_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }
}

fn is_safe_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// `<epoch millis>-<8 hex chars>[.ext]`
fn unique_name(ext: Option<&str>) -> String {
    let millis = Utc::now().timestamp_millis();
    let tag = uuid::Uuid::new_v4().simple().to_string();
    match ext {
        Some(ext) => format!("{millis}-{}.{}", &tag[..8], ext.to_ascii_lowercase()),
        None => format!("{millis}-{}", &tag[..8]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_uses_client_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path(), "/uploads/");
        let src = store.save(b"abc", Some("holiday.JPG"), Some("png")).unwrap();

        assert!(src.filename.ends_with(".jpg"), "{}", src.filename);
        assert_eq!(src.storage_path, format!("/uploads/{}", src.filename));
        let stored = std::fs::read(store.local_path(&src.filename)).unwrap();
        assert_eq!(stored, b"abc");
    }

    #[test]
    fn test_save_falls_back_to_sniffed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path(), "/uploads");
        let src = store.save(b"x", Some("../../etc/passwd"), Some("png")).unwrap();
        assert!(src.filename.ends_with(".png"));
        assert!(!src.filename.contains('/'));
    }

    #[test]
    fn test_save_rejects_odd_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path(), "/uploads");
        let src = store.save(b"x", Some("a.j p g"), None).unwrap();
        assert!(!src.filename.contains('.'));
    }

    #[test]
    fn test_names_are_unique() {
        let a = unique_name(Some("jpg"));
        let b = unique_name(Some("jpg"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("later/uploads"), "/uploads");
        let src = store.save(b"x", None, Some("gif")).unwrap();
        assert!(store.local_path(&src.filename).exists());
    }
}

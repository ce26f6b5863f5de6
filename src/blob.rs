//! Byte storage addressed by relative keys.
//!
//! Key layout:
//! - raw upload: `{image_id}/{image_id}.{ext}`
//! - canonical processed image: `{image_id}/{image_id}.jpg`
//! - cell crop: `{image_id}/{rect_id}.jpg`

use crate::error::BlobError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Extensions probed, in order, when looking for an image's raw upload.
pub const RAW_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub fn raw_key(image_id: Uuid, ext: &str) -> String {
    format!("{image_id}/{image_id}.{ext}")
}

pub fn processed_key(image_id: Uuid) -> String {
    format!("{image_id}/{image_id}.jpg")
}

pub fn cell_key(image_id: Uuid, rect_id: i32) -> String {
    format!("{image_id}/{rect_id}.jpg")
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns `Ok(None)` for a key that does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    async fn put(&self, data: &[u8], key: &str) -> Result<(), BlobError>;

    async fn exists(&self, key: &str) -> bool;

    /// Returns whether something was deleted.
    async fn delete(&self, key: &str) -> Result<bool, BlobError>;
}

/// Finds the raw upload of an image by probing [`RAW_EXTENSIONS`].
pub async fn find_raw_key(store: &dyn BlobStore, image_id: Uuid) -> Option<String> {
    for ext in RAW_EXTENSIONS {
        let key = raw_key(image_id, ext);
        if store.exists(&key).await {
            return Some(key);
        }
    }
    None
}

/// Blob store rooted at a local directory; keys are relative paths below it.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(key, "Blob not found");
                Ok(None)
            }
            Err(source) => Err(BlobError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn put(&self, data: &[u8], key: &str) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        let io_err = |source| BlobError::Io {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&path, data).await.map_err(io_err)?;
        debug!(key, bytes = data.len(), "Blob written");
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        let Ok(path) = self.path_for(key) else {
            return false;
        };
        match tokio::fs::try_exists(&path).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!(key, error = %err, "Could not check blob existence");
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(BlobError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id() -> Uuid {
        Uuid::parse_str("6f1c1b8e-2a51-4f64-9a4b-35f2c3b0a1d7").unwrap()
    }

    #[test]
    fn keys_follow_layout() {
        let id = id();
        assert_eq!(raw_key(id, "png"), format!("{id}/{id}.png"));
        assert_eq!(processed_key(id), format!("{id}/{id}.jpg"));
        assert_eq!(cell_key(id, 12), format!("{id}/12.jpg"));
    }

    #[tokio::test]
    async fn put_creates_directories_and_get_reads_back() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let key = processed_key(id());

        store.put(b"jpeg bytes", &key).await.unwrap();

        assert!(store.exists(&key).await);
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some(&b"jpeg bytes"[..]));
    }

    #[tokio::test]
    async fn missing_key_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        assert_eq!(store.get("nope/nope.jpg").await.unwrap(), None);
        assert!(!store.exists("nope/nope.jpg").await);
        assert!(!store.delete("nope/nope.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path().join("blobs"));

        assert!(matches!(
            store.put(b"x", "../outside.jpg").await,
            Err(BlobError::InvalidKey(_))
        ));
        assert!(matches!(store.get("/etc/passwd").await, Err(BlobError::InvalidKey(_))));
        assert!(!store.exists("").await);
    }

    #[tokio::test]
    async fn raw_probe_prefers_jpg_then_jpeg_then_png() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let id = id();

        assert_eq!(find_raw_key(&store, id).await, None);

        store.put(b"png", &raw_key(id, "png")).await.unwrap();
        assert_eq!(find_raw_key(&store, id).await, Some(raw_key(id, "png")));

        store.put(b"jpeg", &raw_key(id, "jpeg")).await.unwrap();
        assert_eq!(find_raw_key(&store, id).await, Some(raw_key(id, "jpeg")));
    }

    #[tokio::test]
    async fn delete_removes_blob() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let key = cell_key(id(), 3);
        store.put(b"crop", &key).await.unwrap();

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.exists(&key).await);
    }
}

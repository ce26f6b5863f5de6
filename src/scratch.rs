//! Local working copies of blobs, one directory per image.

use crate::blob::BlobStore;
use crate::error::StageError;
use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Scratch {
    root: PathBuf,
}

impl Scratch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mirrors the blob key layout below the scratch root.
    pub fn local_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn image_dir(&self, image_id: Uuid) -> PathBuf {
        self.root.join(image_id.to_string())
    }

    /// Path for a stage-specific artifact such as `contour-out.json`.
    pub fn artifact(&self, image_id: Uuid, prefix: &str, suffix: &str) -> PathBuf {
        self.image_dir(image_id).join(format!("{prefix}-{suffix}"))
    }

    /// Downloads `key` to its local path unless a copy is already there.
    pub async fn materialize(&self, blobs: &dyn BlobStore, key: &str) -> Result<PathBuf, StageError> {
        let path = self.local_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::io(parent, e))?;
        }

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(key, "Using cached local copy");
            return Ok(path);
        }

        let data = blobs.get(key).await?.ok_or_else(|| StageError::MissingBlob {
            key: key.to_string(),
        })?;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| StageError::io(&path, e))?;

        Ok(path)
    }

    /// Uploads a local file to `key` and refreshes the cached copy of that key.
    pub async fn publish(&self, blobs: &dyn BlobStore, file: &Path, key: &str) -> Result<(), StageError> {
        let data = tokio::fs::read(file)
            .await
            .map_err(|e| StageError::io(file, e))?;
        blobs.put(&data, key).await?;

        let cached = self.local_path(key);
        if cached != file {
            if let Some(parent) = cached.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StageError::io(parent, e))?;
            }
            tokio::fs::write(&cached, &data)
                .await
                .map_err(|e| StageError::io(&cached, e))?;
        }
        Ok(())
    }

    /// Best effort; failures are logged and swallowed.
    pub async fn cleanup(&self, image_id: Uuid) {
        let dir = self.image_dir(image_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(%image_id, "Removed scratch directory"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(%image_id, error = %err, "Could not remove scratch directory"),
        }
    }
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StageError> {
    let content = tokio::fs::read(path)
        .await
        .map_err(|e| StageError::io(path, e))?;
    serde_json::from_slice(&content)
        .map_err(|e| StageError::invalid(format!("{} is not valid JSON: {e}", path.display())))
}

pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StageError> {
    let content = serde_json::to_vec(value)
        .map_err(|e| StageError::invalid(format!("could not serialize {}: {e}", path.display())))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StageError::io(parent, e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| StageError::io(path, e))
}

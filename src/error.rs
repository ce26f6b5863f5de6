use crate::config::MissingBlobPolicy;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Invalid blob key '{0}'")]
    InvalidKey(String),

    #[error("Blob I/O failed for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Image {0} not found")]
    ImageNotFound(uuid::Uuid),
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start subprocess '{script}': {source}")]
    Spawn {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Subprocess I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subprocess exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Subprocess timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Why one image failed (or was skipped) in one stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Blob '{key}' not found")]
    MissingBlob { key: String },

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("Status store error: {0}")]
    Store(#[from] StoreError),

    #[error("Processing failed: {0}")]
    Process(#[from] ProcessError),

    #[error("Invalid result: {0}")]
    InvalidResult(String),

    #[error("Scratch I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Panicked while processing: {0}")]
    Panicked(String),
}

impl StageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the image should be left alone and retried on a later cycle.
    pub fn is_transient(&self, policy: MissingBlobPolicy) -> bool {
        matches!(self, StageError::MissingBlob { .. }) && policy == MissingBlobPolicy::Skip
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        StageError::InvalidResult(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_blob_under_skip_is_transient() {
        let missing = StageError::MissingBlob {
            key: "a/a.jpg".to_string(),
        };
        assert!(missing.is_transient(MissingBlobPolicy::Skip));
        assert!(!missing.is_transient(MissingBlobPolicy::Fail));
        assert!(!StageError::invalid("bad").is_transient(MissingBlobPolicy::Skip));
    }
}

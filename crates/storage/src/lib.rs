//! Blob storage for run artifacts (Robot logs, reports, console output).
//!
//! Callers depend on the [`ArtifactStore`] trait. [`s3::S3ArtifactStore`]
//! talks to MinIO or S3; [`local::LocalArtifactStore`] keeps blobs in a
//! directory for development and tests.

pub mod local;
pub mod s3;

use std::time::Duration;

use async_trait::async_trait;
use robotq_core::types::DbId;

pub use local::LocalArtifactStore;
pub use s3::{S3ArtifactStore, S3Config};

/// Default lifetime of a presigned retrieval URL (one hour).
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Artifact not found: {key}")]
    NotFound { key: String },

    #[error("Invalid artifact key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("Storage {operation} failed for '{key}': {message}")]
    Backend {
        operation: &'static str,
        key: String,
        message: String,
    },

    #[error("Storage I/O failed for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Put/get/presign/delete over byte blobs addressed by string keys.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any existing blob. Returns the key.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Time-limited retrieval URL for an existing blob.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Delete the blob. Returns `false` if nothing was stored under `key`.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}

/// Storage key for an artifact of a run: `runs/{run_id}/{file_name}`.
pub fn artifact_key(run_id: DbId, file_name: &str) -> String {
    format!("runs/{run_id}/{file_name}")
}

/// Reject keys that could escape a storage root or address nothing.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason| {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };
    if key.is_empty() {
        return invalid("key is empty");
    }
    if key.starts_with('/') || key.contains('\\') {
        return invalid("key must be a relative forward-slash path");
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return invalid("key contains an empty or relative segment");
    }
    Ok(())
}

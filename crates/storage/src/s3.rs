//! MinIO / S3 artifact store.

use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::{validate_key, ArtifactStore, StorageError};

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Full endpoint URL (e.g. `http://localhost:9000`). `None` uses AWS.
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

/// Artifact store over the AWS SDK with path-style addressing, which MinIO
/// requires.
#[derive(Debug, Clone)]
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
}

fn backend<E>(operation: &'static str, key: &str, err: E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::Backend {
        operation,
        key: key.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}

impl S3ArtifactStore {
    /// Build a client from static credentials. No network calls are made.
    pub async fn connect(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "robotq-static",
        );
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(true);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the bucket if it does not exist yet.
    pub async fn ensure_bucket(&self) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| backend("create_bucket", &self.bucket, e))?;
                tracing::info!(bucket = %self.bucket, "Created artifact bucket");
                Ok(())
            }
            Err(err) => Err(backend("head_bucket", &self.bucket, err)),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| backend("put", key, e))?;
        tracing::debug!(bucket = %self.bucket, key, size, "Stored artifact");
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(StorageError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(err) => return Err(backend("get", key, err)),
        };
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| backend("get", key, e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(key)?;
        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| backend("presign", key, e))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| backend("presign", key, e))?;
        Ok(request.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        // S3 deletes are idempotent, so existence is checked first.
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {}
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                return Ok(false)
            }
            Err(err) => return Err(backend("delete", key, err)),
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend("delete", key, e))?;
        Ok(true)
    }
}

use crate::object_key::KeyGenerator;
use crate::object_store::ObjectStore;
use crate::upload_validator::{UploadValidator, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors from the storage gateway
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The object may or may not exist after this error
    #[error("failed to upload file: {0:#}")]
    Transport(anyhow::Error),

    #[error("failed to delete object {key}: {reason:#}")]
    Delete { key: String, reason: anyhow::Error },

    #[error("failed to generate presigned URL: {0:#}")]
    Presign(anyhow::Error),
}

/// A stored object. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub url: String,
    pub key: String,
    pub bucket: String,
    pub size: u64,
    pub mime_type: String,
}

/// A time-bounded read URL
#[derive(Debug, Clone, Serialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Validates, names and stores uploads
pub struct ObjectStorageGateway {
    store: Arc<dyn ObjectStore>,
    validator: UploadValidator,
    keys: KeyGenerator,
}

impl ObjectStorageGateway {
    pub fn new(store: Arc<dyn ObjectStore>, validator: UploadValidator) -> Self {
        Self {
            store,
            validator,
            keys: KeyGenerator::new(),
        }
    }

    /// Validate, generate a key and upload.
    ///
    /// Transport failures are returned as-is with no retry.
    #[instrument(skip(self, body), fields(folder = %folder))]
    pub async fn upload(
        &self,
        body: Bytes,
        filename: &str,
        size: u64,
        folder: &str,
    ) -> Result<UploadResult, UploadError> {
        let validated = self.validator.validate(filename, size).map_err(|e| {
            metrics::counter!("uploads.rejected").increment(1);
            e
        })?;

        let key = self.keys.generate_key(filename, folder);

        debug!(key = %key, size_bytes = size, "Uploading object");

        let url = self
            .store
            .put_object(&key, body, validated.mime_type)
            .await
            .map_err(|e| {
                metrics::counter!("uploads.failed").increment(1);
                UploadError::Transport(e)
            })?;

        metrics::counter!("uploads.stored").increment(1);
        metrics::counter!("uploads.bytes").increment(size);

        info!(key = %key, size_bytes = size, "Object uploaded successfully");

        Ok(UploadResult {
            url,
            key,
            bucket: self.store.bucket(),
            size,
            mime_type: validated.mime_type.to_string(),
        })
    }

    /// Best-effort delete. Failure is logged here and returned; callers decide whether
    /// it matters.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), UploadError> {
        match self.store.delete_object(key).await {
            Ok(()) => {
                debug!(key = %key, "Object deleted");
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete object");
                Err(UploadError::Delete {
                    key: key.to_string(),
                    reason: e,
                })
            }
        }
    }

    /// Presign a GET for `key`, valid for `ttl`
    pub async fn presign(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, UploadError> {
        let url = self
            .store
            .presign_get(key, ttl)
            .await
            .map_err(UploadError::Presign)?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(PresignedUrl { url, expires_at })
    }
}

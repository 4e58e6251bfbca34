//! Upload-then-record sequencing.
//!
//! There is no transaction spanning the object store and the database. An object exists
//! without a record between the upload and the record write, and it is left orphaned if the
//! compensating delete fails or times out. Both windows are logged, never hidden.

use crate::storage_gateway::{ObjectStorageGateway, UploadError, UploadResult};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Nothing was written to the database
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// The record write failed after the object was stored
    #[error("failed to record upload: {0:#}")]
    Record(anyhow::Error),
}

/// File received from a client
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub filename: String,
    pub body: Bytes,
}

impl IncomingFile {
    pub fn new(filename: impl Into<String>, body: Bytes) -> Self {
        Self {
            filename: filename.into(),
            body,
        }
    }

    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Uploads an object, then applies a record update that references it, deleting the
/// object again if the update fails
pub struct UploadCoordinator {
    gateway: Arc<ObjectStorageGateway>,
    compensation_timeout: Duration,
}

impl UploadCoordinator {
    pub fn new(gateway: Arc<ObjectStorageGateway>, compensation_timeout: Duration) -> Self {
        Self {
            gateway,
            compensation_timeout,
        }
    }

    pub fn gateway(&self) -> &Arc<ObjectStorageGateway> {
        &self.gateway
    }

    /// Upload `file` under `folder`, then run `record` with the stored object.
    ///
    /// If `record` fails the object is deleted (bounded by the compensation timeout) and the
    /// record error is returned unchanged. A failed delete is only logged.
    #[instrument(skip(self, file, record), fields(folder = %folder, filename = %file.filename))]
    pub async fn upload_then_record<F, Fut, T>(
        &self,
        file: IncomingFile,
        folder: &str,
        record: F,
    ) -> Result<(UploadResult, T), CoordinatorError>
    where
        F: FnOnce(UploadResult) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let size = file.size();
        let uploaded = self
            .gateway
            .upload(file.body, &file.filename, size, folder)
            .await?;

        match record(uploaded.clone()).await {
            Ok(value) => Ok((uploaded, value)),
            Err(record_error) => {
                metrics::counter!("uploads.compensated").increment(1);
                warn!(
                    key = %uploaded.key,
                    error = %record_error,
                    "Record write failed, deleting uploaded object"
                );

                self.compensate(&uploaded.key).await;

                Err(CoordinatorError::Record(record_error))
            }
        }
    }

    async fn compensate(&self, key: &str) {
        match tokio::time::timeout(self.compensation_timeout, self.gateway.delete(key)).await {
            Ok(Ok(())) => {
                info!(key = %key, "Compensating delete succeeded");
            }
            Ok(Err(e)) => {
                metrics::counter!("uploads.orphaned").increment(1);
                error!(key = %key, error = %e, "Compensating delete failed, object orphaned");
            }
            Err(_) => {
                metrics::counter!("uploads.orphaned").increment(1);
                error!(
                    key = %key,
                    timeout_ms = self.compensation_timeout.as_millis() as u64,
                    "Compensating delete timed out, object may be orphaned"
                );
            }
        }
    }
}

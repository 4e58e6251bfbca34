use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Object transport used by the storage gateway
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket all keys live in
    fn bucket(&self) -> String;

    /// Store `body` under `key` and return the object's URL
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<String>;

    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Time-bounded GET URL; does not touch stored state
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String>;
}

/// S3 (or MinIO) object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "swiflet-static",
            ));
        }

        // Custom endpoints are S3-compatible stores (MinIO), which need path-style access
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint_url)
                .force_path_style(true);
        } else if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Public URL of an object
    pub fn object_url(&self, key: &str) -> String {
        object_url(&self.config, key)
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload object to S3")?;

        Ok(())
    }

    /// Multipart upload for large files; aborts the upload if any part fails
    async fn multipart_upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        match self.upload_parts(key, &upload_id, body).await {
            Ok(completed) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .context("Failed to complete multipart upload")?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: Bytes,
    ) -> Result<CompletedMultipartUpload> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < body.len() {
            let end = (offset + part_size).min(body.len());
            let chunk = body.slice(offset..end);

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            part_number += 1;
            offset = end;
        }

        Ok(CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> String {
        self.bucket.clone()
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<String> {
        if body.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await?;
        } else {
            self.simple_upload(key, body, content_type).await?;
        }

        debug!(key = %key, "Object uploaded");
        Ok(self.object_url(key))
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete object from S3")?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        let presigning_config =
            PresigningConfig::expires_in(expires_in).context("Failed to create presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")?;

        Ok(presigned.uri().to_string())
    }
}

/// Path-style URL on a custom endpoint, virtual-hosted AWS URL otherwise
fn object_url(config: &S3Config, key: &str) -> String {
    match config.endpoint_url {
        Some(ref endpoint) => format!(
            "{}/{}/{}",
            endpoint.trim_end_matches('/'),
            config.bucket,
            key
        ),
        None if config.force_path_style => format!(
            "https://s3.{}.amazonaws.com/{}/{}",
            config.region, config.bucket, key
        ),
        None => format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            config.bucket, config.region, key
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_custom_endpoint() {
        let config = S3Config {
            endpoint_url: Some("http://minio:9000/".to_string()),
            ..Default::default()
        };

        assert_eq!(
            object_url(&config, "ebooks/book_20240115_103045_abcd12340000.pdf"),
            "http://minio:9000/swiftlead-storage/ebooks/book_20240115_103045_abcd12340000.pdf"
        );
    }

    #[test]
    fn test_object_url_aws() {
        let config = S3Config::default();
        assert_eq!(
            object_url(&config, "users/1/profile/a.png"),
            "https://swiftlead-storage.s3.us-east-1.amazonaws.com/users/1/profile/a.png"
        );

        let path_style = S3Config {
            force_path_style: true,
            ..Default::default()
        };
        assert_eq!(
            object_url(&path_style, "a.png"),
            "https://s3.us-east-1.amazonaws.com/swiftlead-storage/a.png"
        );
    }
}

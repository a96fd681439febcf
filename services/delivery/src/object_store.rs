//! Object storage for delivered archives.

use crate::config::StorageConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Hosting of delivered archives: upload bytes, get a URL, delete.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload an object, replacing any existing object under the same key
    async fn upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// URL under which the object can be downloaded
    async fn public_url(&self, key: &str) -> Result<String>;

    /// Delete an object
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Make a string safe for use inside an object key
pub fn sanitize_key_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Object key of a request's archive: `matched_{email}_{request_id}.zip`
pub fn archive_key(email: &str, request_id: &str) -> String {
    format!(
        "matched_{email}_{request_id}.zip",
        email = sanitize_key_component(email),
        request_id = request_id
    )
}

/// S3-compatible archive store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: StorageConfig,
    url_expiry: Duration,
}

impl S3ObjectStore {
    /// Create a new S3 object store. `url_expiry` bounds presigned URLs.
    pub async fn new(config: &StorageConfig, url_expiry: Duration) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_urls = config.public_base_url.is_some(),
            "Object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
            url_expiry,
        })
    }

    /// Single-part upload for small archives
    async fn simple_upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload archive to S3")?;

        Ok(())
    }

    /// Multipart upload for large archives
    async fn multipart_upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
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
            .context("No upload ID in response")?;

        let mut completed_parts = Vec::new();

        for (index, chunk) in body.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(part.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .context("Failed to complete multipart upload")?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let size_bytes = body.len();

        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await?;
        } else {
            self.simple_upload(key, body, content_type).await?;
        }

        info!(key = %key, size_bytes, "Archive uploaded");
        Ok(())
    }

    async fn public_url(&self, key: &str) -> Result<String> {
        if let Some(ref base) = self.config.public_base_url {
            return Ok(format!("{}/{}", base.trim_end_matches('/'), key));
        }

        let presigning_config = PresigningConfig::expires_in(self.url_expiry)
            .context("Failed to create presigning config")?;

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

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete archive from S3")?;

        debug!(key = %key, "Archive deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_key_component() {
        assert_eq!(sanitize_key_component("a@b.com"), "a_b_com");
        assert_eq!(sanitize_key_component("first.last+tag@mail.example.org"), "first_last_tag_mail_example_org");
        assert_eq!(sanitize_key_component("glasses-001"), "glasses-001");
    }

    #[test]
    fn test_archive_key_is_deterministic() {
        assert_eq!(archive_key("a@b.com", "r1"), "matched_a_b_com_r1.zip");
        assert_eq!(archive_key("a@b.com", "r1"), archive_key("a@b.com", "r1"));
    }
}

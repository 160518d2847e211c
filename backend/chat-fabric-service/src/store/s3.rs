use super::MediaStore;
use crate::config::S3Config;
use crate::error::{AppError, AppResult};
use crate::models::MediaRef;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;

/// Removes media objects referenced by hard-deleted messages.
#[derive(Clone)]
pub struct S3MediaStore {
    client: Client,
    bucket: String,
}

impl S3MediaStore {
    pub async fn from_config(config: &S3Config) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            // S3-compatible stores (minio, localstack) need path-style addressing.
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl MediaStore for S3MediaStore {
    async fn remove(&self, media: &[MediaRef]) -> AppResult<()> {
        for item in media {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&item.key)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(key = %item.key, bucket = %self.bucket, error = %e, "media removal failed");
                    AppError::TransientStore(format!("s3 delete {}: {e}", item.key))
                })?;
        }
        Ok(())
    }
}

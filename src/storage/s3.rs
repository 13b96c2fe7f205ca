//! S3 object store using the AWS SDK
//!
//! Works against AWS and S3-compatible services such as MinIO. All objects
//! live in one configured bucket.

use super::traits::{join_url, ObjectStore, StorageError};
use crate::config::BackendConfig;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// S3 object store bound to a single bucket
pub struct S3Backend {
    client: Client,
    bucket: String,
    public_base_url: String,
}

impl S3Backend {
    /// Build an S3 client from a BackendConfig without creating an S3Backend.
    pub fn build_client(config: &BackendConfig) -> Result<Client, StorageError> {
        let (endpoint, region, force_path_style, access_key_id, secret_access_key) = match config {
            BackendConfig::S3 {
                endpoint,
                region,
                force_path_style,
                access_key_id,
                secret_access_key,
                ..
            } => (
                endpoint.clone(),
                region.clone(),
                *force_path_style,
                access_key_id.clone(),
                secret_access_key.clone(),
            ),
            _ => {
                return Err(StorageError::Other(
                    "S3Backend requires S3 configuration".to_string(),
                ))
            }
        };

        // Explicit credentials only; no fallback to the default AWS credential chain.
        let credentials = match (access_key_id, secret_access_key) {
            (Some(ref key_id), Some(ref secret)) => {
                Credentials::new(key_id, secret, None, None, "receipt_ingest-config")
            }
            _ => {
                return Err(StorageError::Other(
                    "S3 backend requires explicit credentials: set RI_S3_ACCESS_KEY_ID and RI_S3_SECRET_ACCESS_KEY".to_string(),
                ));
            }
        };

        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(force_path_style);

        if let Some(ref ep) = endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(ep);
        }

        Ok(Client::from_conf(s3_config_builder.build()))
    }

    /// Create a new S3 backend from configuration
    pub fn new(config: &BackendConfig) -> Result<Self, StorageError> {
        let client = Self::build_client(config)?;
        let (bucket, public_base_url) = match config {
            BackendConfig::S3 {
                bucket,
                endpoint,
                region,
                public_base_url,
                ..
            } => {
                let base = public_base_url.clone().unwrap_or_else(|| match endpoint {
                    Some(ep) => join_url(ep, bucket),
                    None => format!("https://{}.s3.{}.amazonaws.com", bucket, region),
                });
                (bucket.clone(), base)
            }
            _ => {
                return Err(StorageError::Other(
                    "S3Backend requires S3 configuration".to_string(),
                ))
            }
        };
        debug!("S3Backend initialized for bucket {}", bucket);
        Ok(Self {
            client,
            bucket,
            public_base_url,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Classify an S3 SDK error, mapping bucket-level existence errors to
    /// `StorageError::BucketNotFound`.
    fn classify_s3_error(
        bucket: &str,
        e: &SdkError<impl std::fmt::Debug>,
        context: &str,
    ) -> StorageError {
        let debug_str = format!("{:?}", e);
        if debug_str.contains("NoSuchBucket") {
            return StorageError::BucketNotFound(bucket.to_string());
        }
        StorageError::S3(format!("{} failed: {}", context, e))
    }

    async fn bucket_exists(&self) -> bool {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }

    /// Anonymous read access to every object in the bucket.
    fn public_read_policy(&self) -> String {
        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "AWS": ["*"] },
                "Action": ["s3:GetObject"],
                "Resource": [format!("arn:aws:s3:::{}/*", self.bucket)],
            }]
        })
        .to_string()
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    /// Create the bucket when absent and open it for anonymous reads.
    /// A rejected policy only logs a warning.
    #[instrument(skip(self))]
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        if self.bucket_exists().await {
            info!("Bucket '{}' already exists", self.bucket);
            return Ok(());
        }

        info!("Bucket '{}' doesn't exist, creating", self.bucket);
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Self::classify_s3_error(&self.bucket, &e, "create_bucket"))?;

        match self
            .client
            .put_bucket_policy()
            .bucket(&self.bucket)
            .policy(self.public_read_policy())
            .send()
            .await
        {
            Ok(_) => info!("Bucket policy set for '{}'", self.bucket),
            Err(e) => warn!("Could not set bucket policy for '{}': {}", self.bucket, e),
        }
        Ok(())
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let len = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| Self::classify_s3_error(&self.bucket, &e, "put_object"))?;

        debug!("S3 PUT {}/{} ({} bytes)", self.bucket, key, len);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if let SdkError::ServiceError(service_error) = &e {
                    if matches!(
                        service_error.err(),
                        aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)
                    ) {
                        return StorageError::NotFound(key.to_string());
                    }
                }
                Self::classify_s3_error(&self.bucket, &e, "get_object")
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(format!("Failed to read response body: {}", e)))?
            .into_bytes()
            .to_vec();

        debug!("S3 GET {}/{} ({} bytes)", self.bucket, key, data.len());
        Ok(data)
    }

    async fn stat_object(&self, key: &str) -> Result<u64, StorageError> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if let SdkError::ServiceError(service_error) = &e {
                    if matches!(
                        service_error.err(),
                        aws_sdk_s3::operation::head_object::HeadObjectError::NotFound(_)
                    ) {
                        return StorageError::NotFound(key.to_string());
                    }
                }
                Self::classify_s3_error(&self.bucket, &e, "head_object")
            })?;

        Ok(response.content_length().unwrap_or(0).max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::classify_s3_error(&self.bucket, &e, "delete_object"))?;

        debug!("S3 DELETE {}/{}", self.bucket, key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Self::classify_s3_error(&self.bucket, &e, "list_objects_v2"))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn object_url(&self, key: &str) -> String {
        join_url(&self.public_base_url, key)
    }

    /// Presigned GET for an existing object, cacheable for an hour.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.stat_object(key).await?;

        let presign = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Other(format!("invalid presign ttl: {}", e)))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .response_cache_control("max-age=3600")
            .presigned(presign)
            .await
            .map_err(|e| Self::classify_s3_error(&self.bucket, &e, "presign get_object"))?;

        Ok(request.uri().to_string())
    }
}

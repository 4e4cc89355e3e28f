use std::sync::Arc;

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use crate::backend::BackendId;
use crate::error::{StorageError, StorageResult};
use crate::store::BlobStorage;

/// Connection settings for an S3-compatible bucket (AWS, MinIO, Tigris, GCS interop).
#[derive(Clone, Debug)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    /// Overrides the AWS endpoint, e.g. `http://minio:9000`.
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    /// Chain the blobs belong to; the first segment of every object key.
    pub chain_id: u64,
    /// MinIO and most self-hosted gateways need path-style addressing.
    pub force_path_style: bool,
}

/// A `BlobStorage` that writes blobs as objects in an S3-compatible bucket.
#[derive(Clone, Debug)]
pub struct ObjectStoreBlobStorage {
    s3_client: S3Client,
    bucket: String,
    chain_id: u64,
    bucket_ready: Arc<tokio::sync::Mutex<bool>>,
}

/// Creates an S3 client from the ambient AWS configuration plus the overrides in `config`.
pub async fn create_s3_client(config: &ObjectStoreConfig) -> S3Client {
    let region_provider = RegionProviderChain::first_try(
        config.region.clone().map(aws_sdk_s3::config::Region::new),
    )
    .or_default_provider()
    .or_else("us-east-1");
    let base_config = aws_config::defaults(BehaviorVersion::latest())
        .region(region_provider)
        .load()
        .await;

    let mut builder = Builder::from(&base_config).force_path_style(config.force_path_style);
    if let Some(endpoint) = &config.endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }
    S3Client::from_conf(builder.build())
}

/// Object key for a blob: `<chain>/<h[2..4]>/<h[4..6]>/<h[6..8]>/<h[2..]>.bin`.
///
/// Sharding on the leading hash digits keeps bucket listings shallow.
pub fn object_key(chain_id: u64, hash: &str) -> String {
    let digits = hash.strip_prefix("0x").unwrap_or(hash);
    let prefix: Vec<char> = digits.chars().take(6).collect();
    let mut key = chain_id.to_string();
    for segment in prefix.chunks(2) {
        key.push('/');
        key.extend(segment);
    }
    format!("{key}/{digits}.bin")
}

impl ObjectStoreBlobStorage {
    /// Creates a new `ObjectStoreBlobStorage` around an existing client.
    pub fn new(s3_client: S3Client, bucket: impl Into<String>, chain_id: u64) -> Self {
        Self {
            s3_client,
            bucket: bucket.into(),
            chain_id,
            bucket_ready: Arc::new(tokio::sync::Mutex::new(false)),
        }
    }

    /// Builds the client described by `config` and wraps it.
    pub async fn connect(config: &ObjectStoreConfig) -> Self {
        let client = create_s3_client(config).await;
        Self::new(client, config.bucket.clone(), config.chain_id)
    }

    async fn ensure_bucket_exists(&self) -> StorageResult<()> {
        let mut ready = self.bucket_ready.lock().await;
        if *ready {
            return Ok(());
        }

        match self.s3_client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {}
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_not_found() => {
                tracing::info!(bucket = %self.bucket, "creating missing bucket");
                self.s3_client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| StorageError::unavailable(BackendId::ObjectStore, e))?;
            }
            Err(e) => return Err(StorageError::unavailable(BackendId::ObjectStore, e)),
        }
        *ready = true;
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for ObjectStoreBlobStorage {
    fn backend(&self) -> BackendId {
        BackendId::ObjectStore
    }

    async fn store(&self, hash: &str, data: &[u8]) -> StorageResult<String> {
        self.ensure_bucket_exists().await?;
        let key = object_key(self.chain_id, hash);
        self.s3_client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::unavailable(BackendId::ObjectStore, e))?;
        tracing::debug!(bucket = %self.bucket, key = %key, "uploaded blob object");
        Ok(key)
    }

    async fn retrieve(&self, reference: &str) -> StorageResult<Vec<u8>> {
        let resp = self
            .s3_client
            .get_object()
            .bucket(&self.bucket)
            .key(reference)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|service_err| service_err.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    StorageError::not_found(BackendId::ObjectStore, reference)
                } else {
                    StorageError::unavailable(BackendId::ObjectStore, e)
                }
            })?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::unavailable(BackendId::ObjectStore, e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn remove(&self, reference: &str) -> StorageResult<()> {
        self.s3_client
            .delete_object()
            .bucket(&self.bucket)
            .key(reference)
            .send()
            .await
            .map_err(|e| StorageError::unavailable(BackendId::ObjectStore, e))?;
        Ok(())
    }
}

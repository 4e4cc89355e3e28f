use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::backend::BackendId;
use crate::error::{StorageError, StorageResult};
use crate::store::BlobStorage;

const POSTAGE_BATCH_HEADER: &str = "swarm-postage-batch-id";

#[derive(Serialize, Deserialize, Debug)]
struct UploadResponse {
    reference: String,
}

/// A `BlobStorage` that uploads blobs to a Swarm node through its Bee HTTP gateway.
///
/// Swarm references are content addresses, so uploading the same bytes twice
/// returns the same reference.
#[derive(Clone, Debug)]
pub struct SwarmBlobStorage {
    client: Client,
    gateway_url: String,
    postage_batch_id: String,
}

impl SwarmBlobStorage {
    /// Creates a new `SwarmBlobStorage` talking to `gateway_url` (e.g. `http://bee:1633`).
    pub fn new(gateway_url: impl Into<String>, postage_batch_id: impl Into<String>) -> Self {
        let gateway_url: String = gateway_url.into();
        Self {
            client: Client::new(),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            postage_batch_id: postage_batch_id.into(),
        }
    }

    fn bytes_url(&self) -> String {
        format!("{}/bytes", self.gateway_url)
    }

    fn reference_url(&self, reference: &str) -> String {
        format!("{}/bytes/{}", self.gateway_url, reference)
    }

    /// A Swarm reference is 64 hex chars, or 128 for encrypted uploads.
    fn is_valid_reference(reference: &str) -> bool {
        matches!(reference.len(), 64 | 128) && reference.chars().all(|c| c.is_ascii_hexdigit())
    }
}

/// Server errors and throttling are worth retrying; any other status (an unknown
/// or exhausted postage batch, a malformed request) fails the same way every time.
fn status_error(status: StatusCode, what: String) -> StorageError {
    let message = format!("{what} failed with HTTP {status}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StorageError::unavailable(BackendId::Swarm, message)
    } else {
        StorageError::rejected(BackendId::Swarm, message)
    }
}

#[async_trait]
impl BlobStorage for SwarmBlobStorage {
    fn backend(&self) -> BackendId {
        BackendId::Swarm
    }

    async fn store(&self, hash: &str, data: &[u8]) -> StorageResult<String> {
        let resp = self
            .client
            .post(self.bytes_url())
            .header(POSTAGE_BATCH_HEADER, &self.postage_batch_id)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| StorageError::unavailable(BackendId::Swarm, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, format!("upload of blob {hash}")));
        }

        let upload: UploadResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::unavailable(BackendId::Swarm, e))?;
        tracing::debug!(hash, reference = %upload.reference, "uploaded blob to swarm");
        Ok(upload.reference)
    }

    async fn retrieve(&self, reference: &str) -> StorageResult<Vec<u8>> {
        if !Self::is_valid_reference(reference) {
            return Err(StorageError::not_found(BackendId::Swarm, reference));
        }

        let resp = self
            .client
            .get(self.reference_url(reference))
            .send()
            .await
            .map_err(|e| StorageError::unavailable(BackendId::Swarm, e))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(StorageError::not_found(BackendId::Swarm, reference)),
            status if status.is_success() => {
                let data = resp
                    .bytes()
                    .await
                    .map_err(|e| StorageError::unavailable(BackendId::Swarm, e))?;
                Ok(data.to_vec())
            }
            status => Err(status_error(status, format!("download of {reference}"))),
        }
    }

    /// Swarm chunks expire with their postage stamp; there is nothing to delete explicitly.
    async fn remove(&self, _reference: &str) -> StorageResult<()> {
        Ok(())
    }
}

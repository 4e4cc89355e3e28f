use blob_storage_manager::{BackendId, BlobReference};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What discovery knows about a blob when it first sees it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewBlob {
    pub versioned_hash: String,
    pub commitment: String,
    /// Payload size in bytes.
    pub size: u64,
    /// Unknown until the carrying transaction is included in a block.
    pub first_block_number: Option<u64>,
}

/// A blob row as stored in the catalog.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub versioned_hash: String,
    pub commitment: String,
    pub size: u64,
    pub first_block_number: Option<u64>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Blob {
    pub(crate) fn from_new(blob: NewBlob, now: DateTime<Utc>) -> Self {
        Self {
            versioned_hash: blob.versioned_hash,
            commitment: blob.commitment,
            size: blob.size,
            first_block_number: blob.first_block_number,
            inserted_at: now,
            updated_at: now,
        }
    }
}

/// "This blob's bytes can be read from `blob_storage` through `data_reference`."
///
/// Unique per `(blob_hash, blob_storage)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlobDataStorageReference {
    pub blob_hash: String,
    pub blob_storage: BackendId,
    pub data_reference: String,
}

impl BlobDataStorageReference {
    pub fn new(blob_hash: impl Into<String>, reference: &BlobReference) -> Self {
        Self {
            blob_hash: blob_hash.into(),
            blob_storage: reference.backend,
            data_reference: reference.reference.clone(),
        }
    }

    pub fn to_blob_reference(&self) -> BlobReference {
        BlobReference::new(self.blob_storage, self.data_reference.clone())
    }
}

/// Result of an idempotent reference upsert.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UpsertOutcome {
    Inserted,
    /// The same reference was already recorded.
    Unchanged,
}

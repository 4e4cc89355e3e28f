//! Durable record of blobs and of where each copy of their bytes lives.

use async_trait::async_trait;
use blob_storage_manager::{BackendId, BlobReference};

use crate::error::CatalogResult;

mod rocks_catalog;
mod types;

pub use rocks_catalog::RocksCatalog;
pub use types::{Blob, BlobDataStorageReference, NewBlob, UpsertOutcome};

/// Repository for blob rows and their storage references.
///
/// Passed explicitly to whoever needs it; there is no process-wide client.
#[async_trait]
pub trait ReferenceCatalog: Send + Sync {
    /// Inserts the blob unless a row for its hash exists, and returns the stored row.
    async fn insert_blob(&self, blob: NewBlob) -> CatalogResult<Blob>;

    async fn get_blob(&self, hash: &str) -> CatalogResult<Option<Blob>>;

    /// Attaches the block number the blob was first seen in.
    async fn set_first_block_number(&self, hash: &str, block_number: u64) -> CatalogResult<Blob>;

    /// Deletes the blob row together with its references and returns the removed references.
    async fn delete_blob(&self, hash: &str) -> CatalogResult<Vec<BlobDataStorageReference>>;

    /// Inserts the `(hash, backend)` row, or verifies an existing one holds the same reference.
    ///
    /// A differing existing reference is a `ReferenceConflict` and is never overwritten.
    async fn upsert_reference(&self, hash: &str, reference: &BlobReference) -> CatalogResult<UpsertOutcome>;

    async fn get_reference(&self, hash: &str, backend: BackendId) -> CatalogResult<Option<BlobDataStorageReference>>;

    /// All references recorded for `hash`, ordered by backend.
    async fn references_for(&self, hash: &str) -> CatalogResult<Vec<BlobDataStorageReference>>;
}

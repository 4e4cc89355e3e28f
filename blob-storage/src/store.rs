use std::fmt::Debug;

use async_trait::async_trait;

use crate::backend::BackendId;
use crate::error::StorageResult;

/// Uniform store/retrieve contract implemented once per durable backend.
///
/// Implementations own their connection and credential state. `store` must
/// converge: calling it again with the same hash and bytes (for example after
/// a timed out attempt) yields the same reference.
#[async_trait]
pub trait BlobStorage: Debug + Send + Sync {
    /// Which backend this driver writes to.
    fn backend(&self) -> BackendId;

    /// Persists `data` and returns the reference it can be read back with.
    async fn store(&self, hash: &str, data: &[u8]) -> StorageResult<String>;

    /// Fetches bytes previously written by [`BlobStorage::store`].
    async fn retrieve(&self, reference: &str) -> StorageResult<Vec<u8>>;

    /// Drops the stored copy. Removing something that is already gone is not an error.
    async fn remove(&self, reference: &str) -> StorageResult<()>;
}

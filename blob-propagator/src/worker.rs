use std::sync::Arc;

use blob_storage_manager::{BackendId, BlobReference, BlobStorage, BlobStorageManager, StorageResult};

use crate::error::PropagationResult;
use crate::job::JobPayload;
use crate::staging::BlobFileManager;

/// Executes propagation jobs for one backend.
///
/// A worker reads the staged bytes, hands them to its driver and returns the
/// resulting reference. Recording the reference is the coordinator's job, so a
/// failed catalog write never forces another backend upload.
#[derive(Debug, Clone)]
pub struct StorageWorker {
    backend: BackendId,
    storage: Arc<dyn BlobStorage>,
    files: Arc<BlobFileManager>,
}

impl StorageWorker {
    pub fn new(storage: Arc<dyn BlobStorage>, files: Arc<BlobFileManager>) -> Self {
        Self { backend: storage.backend(), storage, files }
    }

    /// Builds the worker for `backend` from the manager's driver registry.
    pub fn for_backend(
        manager: &BlobStorageManager,
        backend: BackendId,
        files: Arc<BlobFileManager>,
    ) -> StorageResult<Self> {
        Ok(Self::new(manager.driver(backend)?, files))
    }

    /// One worker per configured backend.
    pub fn all_from(manager: &BlobStorageManager, files: Arc<BlobFileManager>) -> Vec<Self> {
        manager
            .backends()
            .into_iter()
            .filter_map(|backend| Self::for_backend(manager, backend, files.clone()).ok())
            .collect()
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub async fn process(&self, payload: &JobPayload) -> PropagationResult<BlobReference> {
        let hash = payload.versioned_hash.as_str();
        let data = self.files.read(hash).await?;

        let reference = self.storage.store(hash, &data).await?;
        tracing::info!(hash, backend = %self.backend, reference = %reference, "blob stored");
        Ok(BlobReference::new(self.backend, reference))
    }

    /// Deletes the copy behind `reference` from this worker's backend.
    pub async fn remove(&self, reference: &str) -> PropagationResult<()> {
        self.storage.remove(reference).await?;
        tracing::debug!(backend = %self.backend, reference, "removed blob copy");
        Ok(())
    }
}

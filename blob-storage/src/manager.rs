use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::backend::{BackendId, BlobReference};
use crate::error::{StorageError, StorageResult};
use crate::store::BlobStorage;

/// A backend that rejected a synchronous store.
#[derive(Debug)]
pub struct StoreFailure {
    pub backend: BackendId,
    pub error: StorageError,
}

/// Per-backend results of [`BlobStorageManager::store_blob`].
#[derive(Debug, Default)]
pub struct StoreBlobOutcome {
    pub references: Vec<BlobReference>,
    pub failures: Vec<StoreFailure>,
}

impl StoreBlobOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_total_failure(&self) -> bool {
        self.references.is_empty() && !self.failures.is_empty()
    }
}

/// Registry of the configured storage drivers, keyed by the backend they serve.
///
/// This is the single entry point of the read path and the synchronous write
/// path that bypasses the job dispatcher.
#[derive(Clone, Debug, Default)]
pub struct BlobStorageManager {
    storages: HashMap<BackendId, Arc<dyn BlobStorage>>,
}

impl BlobStorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver under the backend it reports, replacing any previous one.
    pub fn register(&mut self, storage: Arc<dyn BlobStorage>) -> &mut Self {
        let backend = storage.backend();
        if self.storages.insert(backend, storage).is_some() {
            tracing::warn!(%backend, "replaced an already registered storage driver");
        }
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn BlobStorage>) -> Self {
        self.register(storage);
        self
    }

    pub fn driver(&self, backend: BackendId) -> StorageResult<Arc<dyn BlobStorage>> {
        self.storages
            .get(&backend)
            .cloned()
            .ok_or(StorageError::UnknownBackend(backend))
    }

    /// Configured backends in a stable order.
    pub fn backends(&self) -> Vec<BackendId> {
        let mut backends: Vec<_> = self.storages.keys().copied().collect();
        backends.sort();
        backends
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    /// Reads a blob back through the driver that owns `reference`.
    pub async fn get_blob(&self, reference: &BlobReference) -> StorageResult<Vec<u8>> {
        let storage = self.driver(reference.backend)?;
        storage.retrieve(&reference.reference).await
    }

    /// Tries each reference in turn and returns the first blob that could be read.
    ///
    /// Fails with the last error seen.
    pub async fn get_blob_from_any(&self, references: &[BlobReference]) -> StorageResult<Vec<u8>> {
        let mut last_error = None;
        for reference in references {
            match self.get_blob(reference).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    tracing::warn!(backend = %reference.backend, reference = %reference.reference, error = %e, "blob read failed, trying next reference");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(StorageError::NoReferences))
    }

    /// Stores `data` in every configured backend concurrently.
    ///
    /// One backend failing never discards the others' references.
    pub async fn store_blob(&self, hash: &str, data: &[u8]) -> StoreBlobOutcome {
        let stores = self.storages.iter().map(|(backend, storage)| async move {
            let result = storage.store(hash, data).await;
            (*backend, result)
        });

        let mut outcome = StoreBlobOutcome::default();
        for (backend, result) in join_all(stores).await {
            match result {
                Ok(reference) => outcome.references.push(BlobReference::new(backend, reference)),
                Err(error) => {
                    tracing::warn!(hash, %backend, error = %error, "synchronous blob store failed");
                    outcome.failures.push(StoreFailure { backend, error });
                }
            }
        }
        outcome.references.sort_by_key(|reference| reference.backend);
        outcome.failures.sort_by_key(|failure| failure.backend);
        outcome
    }
}

use blob_propagator::{CatalogError, PropagationError};
use blob_storage_manager::{BackendId, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("backend {backend} needs {setting} to be configured")]
    MissingSetting {
        backend: BackendId,
        setting: &'static str,
    },

    #[error("no backends configured")]
    NoBackends,

    #[error("required backend {0} is not in the configured backend list")]
    RequiredNotConfigured(BackendId),

    #[error("Failed to set up a storage backend")]
    Storage(#[from] StorageError),

    #[error("Failed to open the reference catalog")]
    Catalog(#[from] CatalogError),

    #[error("An error occurred while propagating blobs")]
    Propagation(#[from] PropagationError),

    #[error("Failed to wait for the shutdown signal")]
    Signal(#[source] std::io::Error),
}

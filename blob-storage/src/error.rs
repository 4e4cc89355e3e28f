use std::error::Error;

use thiserror::Error;

use crate::backend::BackendId;

pub type StorageResult<T> = Result<T, StorageError>;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient infrastructure failure; safe to retry.
    #[error("{backend} storage is unavailable: {source}")]
    BackendUnavailable {
        backend: BackendId,
        #[source]
        source: BoxError,
    },

    #[error("reference `{reference}` was not found in {backend} storage")]
    ReferenceNotFound { backend: BackendId, reference: String },

    /// The backend refused the request; repeating it unchanged will not help.
    #[error("{backend} storage rejected the request: {reason}")]
    Rejected { backend: BackendId, reason: String },

    #[error("no storage driver is configured for backend {0}")]
    UnknownBackend(BackendId),

    #[error("no storage references were supplied")]
    NoReferences,
}

impl StorageError {
    pub fn unavailable(backend: BackendId, source: impl Into<BoxError>) -> Self {
        StorageError::BackendUnavailable { backend, source: source.into() }
    }

    pub fn not_found(backend: BackendId, reference: impl Into<String>) -> Self {
        StorageError::ReferenceNotFound { backend, reference: reference.into() }
    }

    pub fn rejected(backend: BackendId, reason: impl Into<String>) -> Self {
        StorageError::Rejected { backend, reason: reason.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::BackendUnavailable { .. })
    }
}

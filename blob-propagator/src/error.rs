use std::io;

use blob_storage_manager::{BackendId, StorageError};
use thiserror::Error;

pub type CatalogResult<T> = Result<T, CatalogError>;

pub type PropagationResult<T> = Result<T, PropagationError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("blob {0} is not in the catalog")]
    BlobNotFound(String),

    /// The stored reference differs from the new one: the driver is not idempotent.
    #[error("blob {hash} already has {backend} reference `{existing}`, refusing to replace it with `{attempted}`")]
    ReferenceConflict {
        hash: String,
        backend: BackendId,
        existing: String,
        attempted: String,
    },

    #[error("catalog storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// The catalog could not be reached; the write may succeed when repeated.
    #[error("catalog is unavailable: {0}")]
    Unavailable(String),

    #[error("catalog row could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("catalog column family `{0}` is missing")]
    MissingColumnFamily(&'static str),
}

impl CatalogError {
    /// Only a failing database round trip is worth repeating.
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Storage(_) | CatalogError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum PropagationError {
    #[error("couldn't read blob {hash} data file: file is missing")]
    StagingFileMissing { hash: String },

    #[error("`{0}` is not a usable blob hash")]
    InvalidHash(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// Discrete classification of [`PropagationError`] for callers that branch on failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    StagingFileMissing,
    BackendUnavailable,
    ReferenceNotFound,
    UnknownBackend,
    /// The backend refused the request outright.
    Rejected,
    ReferenceConflict,
    InvalidHash,
    Catalog,
    Io,
}

impl PropagationError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        PropagationError::Io { context: context.into(), source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PropagationError::StagingFileMissing { .. } => ErrorKind::StagingFileMissing,
            PropagationError::InvalidHash(_) => ErrorKind::InvalidHash,
            PropagationError::Storage(StorageError::BackendUnavailable { .. }) => ErrorKind::BackendUnavailable,
            PropagationError::Storage(StorageError::ReferenceNotFound { .. })
            | PropagationError::Storage(StorageError::NoReferences) => ErrorKind::ReferenceNotFound,
            PropagationError::Storage(StorageError::UnknownBackend(_)) => ErrorKind::UnknownBackend,
            PropagationError::Storage(StorageError::Rejected { .. }) => ErrorKind::Rejected,
            PropagationError::Catalog(CatalogError::ReferenceConflict { .. }) => ErrorKind::ReferenceConflict,
            PropagationError::Catalog(_) => ErrorKind::Catalog,
            PropagationError::Io { .. } => ErrorKind::Io,
        }
    }

    /// True for failures the dispatcher may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            PropagationError::Storage(e) => e.is_transient(),
            PropagationError::Catalog(e) => e.is_transient(),
            _ => false,
        }
    }

    /// The blob hash this error is about, when it carries one.
    pub fn hash(&self) -> Option<&str> {
        match self {
            PropagationError::StagingFileMissing { hash } => Some(hash),
            PropagationError::InvalidHash(hash) => Some(hash),
            PropagationError::Catalog(CatalogError::ReferenceConflict { hash, .. }) => Some(hash),
            PropagationError::Catalog(CatalogError::BlobNotFound(hash)) => Some(hash),
            _ => None,
        }
    }
}

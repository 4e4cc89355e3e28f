//! Storage drivers for blob payloads and the manager that routes reads and
//! synchronous writes to them.

mod backend;
mod error;
mod manager;
mod store;

pub mod database_store;
pub mod local_store;
pub mod object_store;
pub mod swarm_store;

pub use backend::{BackendId, BlobReference, ParseBackendIdError};
pub use error::{StorageError, StorageResult};
pub use manager::{BlobStorageManager, StoreBlobOutcome, StoreFailure};
pub use store::BlobStorage;

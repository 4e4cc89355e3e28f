#![allow(clippy::uninlined_format_args)]
#![deny(unused_qualifications)]

//! Propagation of staged blobs into every configured storage backend.
//!
//! A blob lands in the staging directory, one [`PropagationJob`] per backend is
//! handed to the [`Dispatcher`], each [`StorageWorker`] uploads the bytes, and the
//! [`PropagationCoordinator`] records the returned reference in the
//! [`ReferenceCatalog`] and drops the staged file once it is safe to do so.

pub mod catalog;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod retry;
pub mod staging;
pub mod worker;

pub use catalog::{Blob, BlobDataStorageReference, NewBlob, ReferenceCatalog, RocksCatalog, UpsertOutcome};
pub use coordinator::{PropagationCoordinator, RecordOutcome, SweepReport};
pub use dispatcher::{join_reports, DeletionReport, Dispatcher, DispatcherConfig};
pub use error::{CatalogError, CatalogResult, ErrorKind, PropagationError, PropagationResult};
pub use job::{JobFailure, JobPayload, JobReport, JobState, PropagationJob};
pub use retry::RetryPolicy;
pub use staging::{validate_hash, BlobFileManager};
pub use worker::StorageWorker;

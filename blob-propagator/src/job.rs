use std::time::Duration;

use blob_storage_manager::{BackendId, BlobReference};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PropagationError;

/// Wire payload of a propagation job: `{ "versionedHash": "0x..." }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub versioned_hash: String,
}

impl JobPayload {
    pub fn new(versioned_hash: impl Into<String>) -> Self {
        Self { versioned_hash: versioned_hash.into() }
    }
}

/// A request to store one blob in one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationJob {
    pub backend: BackendId,
    pub payload: JobPayload,
    /// Attempts already made, for jobs handed over mid-way through their retries.
    pub attempts_made: u32,
}

impl PropagationJob {
    pub fn new(backend: BackendId, versioned_hash: impl Into<String>) -> Self {
        Self { backend, payload: JobPayload::new(versioned_hash), attempts_made: 0 }
    }

    pub fn hash(&self) -> &str {
        &self.payload.versioned_hash
    }
}

/// Where an unfinished `(blob, backend)` propagation stands.
///
/// There is no success state: a succeeded job is represented by its catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running { attempt: u32 },
    /// The last attempt failed transiently; another one is scheduled.
    Failed { attempt: u32, error: String },
    /// Terminal without a catalog row; needs an operator.
    Dead { attempts: u32, error: String },
}

/// Why a job attempt did not produce a recorded reference.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error(transparent)]
    Propagation(#[from] PropagationError),

    #[error("job attempt timed out after {0:?}")]
    TimedOut(Duration),

    #[error("job attempt panicked: {0}")]
    Panicked(String),

    #[error("job was cancelled")]
    Cancelled,
}

impl JobFailure {
    /// Transient backend errors and timeouts are retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobFailure::Propagation(e) => e.is_transient(),
            JobFailure::TimedOut(_) => true,
            JobFailure::Panicked(_) | JobFailure::Cancelled => false,
        }
    }
}

/// Final word on a submitted job.
#[derive(Debug)]
pub struct JobReport {
    pub job: PropagationJob,
    /// Attempts made, including earlier ones counted in `attempts_made`.
    pub attempts: u32,
    pub outcome: Result<BlobReference, JobFailure>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The durable storage targets a blob can be propagated to.
///
/// Adding a backend means adding a variant here and registering a driver for
/// it with the [`BlobStorageManager`](crate::BlobStorageManager).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendId {
    /// A directory on a locally mounted volume.
    Filesystem,
    /// An S3-compatible object store bucket.
    ObjectStore,
    /// A RocksDB column holding the raw bytes keyed by hash.
    Database,
    /// A Swarm (peer-to-peer content network) node reached through its HTTP gateway.
    Swarm,
}

impl BackendId {
    pub const ALL: [BackendId; 4] = [
        BackendId::Filesystem,
        BackendId::ObjectStore,
        BackendId::Database,
        BackendId::Swarm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendId::Filesystem => "FILESYSTEM",
            BackendId::ObjectStore => "OBJECT_STORE",
            BackendId::Database => "DATABASE",
            BackendId::Swarm => "SWARM",
        }
    }
}

impl Display for BackendId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown backend identifier `{0}`")]
pub struct ParseBackendIdError(String);

impl FromStr for BackendId {
    type Err = ParseBackendIdError;

    /// Accepts `OBJECT_STORE`, `object_store` and `object-store` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        BackendId::ALL
            .into_iter()
            .find(|backend| backend.as_str() == normalized)
            .ok_or_else(|| ParseBackendIdError(s.to_string()))
    }
}

/// Says that a blob's bytes can be fetched from `backend` using `reference`.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash)]
pub struct BlobReference {
    pub backend: BackendId,
    /// Opaque, backend specific locator.
    pub reference: String,
}

impl BlobReference {
    pub fn new(backend: BackendId, reference: impl Into<String>) -> Self {
        Self { backend, reference: reference.into() }
    }
}

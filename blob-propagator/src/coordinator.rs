use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use blob_storage_manager::{BackendId, BlobReference};

use crate::catalog::{ReferenceCatalog, UpsertOutcome};
use crate::error::{CatalogError, PropagationResult};
use crate::staging::BlobFileManager;

/// What happened when a worker's reference was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub upsert: UpsertOutcome,
    /// Whether this record completed the required set and the staged file was dropped.
    pub staging_removed: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    /// Stale files kept because no backend holds a copy yet.
    pub retained: Vec<String>,
    /// Temp files of interrupted writes that were cleaned up.
    pub abandoned_writes: usize,
}

/// Bridges worker output to the catalog and owns the staged-file removal policy.
pub struct PropagationCoordinator {
    catalog: Arc<dyn ReferenceCatalog>,
    files: Arc<BlobFileManager>,
    required_backends: BTreeSet<BackendId>,
}

impl PropagationCoordinator {
    /// `required_backends` must all hold a copy before a staged file is removed
    /// eagerly. With an empty set removal is left to [`PropagationCoordinator::sweep`].
    pub fn new(
        catalog: Arc<dyn ReferenceCatalog>,
        files: Arc<BlobFileManager>,
        required_backends: impl IntoIterator<Item = BackendId>,
    ) -> Self {
        Self {
            catalog,
            files,
            required_backends: required_backends.into_iter().collect(),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn ReferenceCatalog> {
        &self.catalog
    }

    pub fn files(&self) -> &Arc<BlobFileManager> {
        &self.files
    }

    pub fn required_backends(&self) -> &BTreeSet<BackendId> {
        &self.required_backends
    }

    /// Upserts the `(hash, backend)` row for a successful worker result.
    ///
    /// A reference conflict is returned as an error and the existing row is left
    /// untouched.
    pub async fn record(&self, hash: &str, reference: &BlobReference) -> PropagationResult<RecordOutcome> {
        let upsert = match self.catalog.upsert_reference(hash, reference).await {
            Ok(upsert) => upsert,
            Err(e) => {
                if let CatalogError::ReferenceConflict { .. } = &e {
                    tracing::error!(hash, backend = %reference.backend, error = %e, "storage driver returned a different reference for the same blob");
                }
                return Err(e.into());
            }
        };
        tracing::debug!(hash, backend = %reference.backend, ?upsert, "recorded blob reference");

        let staging_removed = self.remove_staged_if_complete(hash).await;
        Ok(RecordOutcome { upsert, staging_removed })
    }

    /// Required backends that still have no catalog row for `hash`.
    pub async fn pending_backends(&self, hash: &str) -> PropagationResult<BTreeSet<BackendId>> {
        let stored: BTreeSet<_> = self
            .catalog
            .references_for(hash)
            .await?
            .into_iter()
            .map(|row| row.blob_storage)
            .collect();
        Ok(self.required_backends.difference(&stored).copied().collect())
    }

    /// Removal failures are only logged; the periodic sweep catches the file later.
    async fn remove_staged_if_complete(&self, hash: &str) -> bool {
        if self.required_backends.is_empty() {
            return false;
        }
        match self.pending_backends(hash).await {
            Ok(pending) if pending.is_empty() => match self.files.remove(hash).await {
                Ok(removed) => {
                    if removed {
                        tracing::info!(hash, "blob stored in every required backend, staged file removed");
                    }
                    removed
                }
                Err(e) => {
                    tracing::warn!(hash, error = %e, "couldn't remove staged blob file");
                    false
                }
            },
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(hash, error = %e, "couldn't check remaining backends for blob");
                false
            }
        }
    }

    /// Removes staged files older than `grace` that at least one backend holds a copy of.
    ///
    /// Files with no copy anywhere are retained so a blob is never lost. Temp files
    /// of writes interrupted before their rename are deleted past the same grace.
    pub async fn sweep(&self, grace: Duration) -> PropagationResult<SweepReport> {
        let cutoff = SystemTime::now().checked_sub(grace).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut report = SweepReport {
            abandoned_writes: self.files.remove_abandoned_writes(cutoff).await?,
            ..SweepReport::default()
        };

        for hash in self.files.staged_before(cutoff).await? {
            if self.catalog.references_for(&hash).await?.is_empty() {
                tracing::warn!(hash = %hash, "stale staged blob has no stored copy, keeping it");
                report.retained.push(hash);
                continue;
            }
            self.files.remove(&hash).await?;
            report.removed.push(hash);
        }

        if report != SweepReport::default() {
            tracing::info!(
                removed = report.removed.len(),
                retained = report.retained.len(),
                abandoned_writes = report.abandoned_writes,
                "staging sweep finished"
            );
        }
        Ok(report)
    }
}

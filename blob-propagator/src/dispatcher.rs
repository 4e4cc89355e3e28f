use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use blob_storage_manager::{BackendId, BlobReference, StorageError};
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::coordinator::PropagationCoordinator;
use crate::error::{PropagationError, PropagationResult};
use crate::job::{JobFailure, JobPayload, JobReport, JobState, PropagationJob};
use crate::retry::RetryPolicy;
use crate::worker::StorageWorker;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Attempts allowed to run at the same time against each backend.
    pub concurrency: usize,
    /// Upper bound on a single attempt (staged read plus driver store).
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            job_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// What [`Dispatcher::delete_blob`] managed to remove.
#[derive(Debug, Default)]
pub struct DeletionReport {
    pub removed: Vec<BlobReference>,
    /// Copies whose backend refused or could not be reached; they need another pass.
    pub orphaned: Vec<(BlobReference, PropagationError)>,
    pub staging_removed: bool,
}

type JobKey = (String, BackendId);

struct DispatcherInner {
    workers: HashMap<BackendId, StorageWorker>,
    coordinator: Arc<PropagationCoordinator>,
    config: DispatcherConfig,
    /// One pool per backend so a slow backend only ever queues its own jobs.
    permits: HashMap<BackendId, Arc<Semaphore>>,
    /// Unfinished and dead jobs. Succeeded jobs are dropped; their catalog row is the record.
    states: DashMap<JobKey, JobState>,
}

/// In-process job dispatcher: at-least-once execution of propagation jobs with
/// bounded retries, a per-attempt timeout, and per-job fault isolation.
///
/// Every attempt runs in its own task. A panic inside a driver turns into a
/// [`JobFailure::Panicked`] for that job only.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        workers: impl IntoIterator<Item = StorageWorker>,
        coordinator: Arc<PropagationCoordinator>,
        config: DispatcherConfig,
    ) -> Self {
        let workers: HashMap<_, _> = workers.into_iter().map(|worker| (worker.backend(), worker)).collect();
        let slots = config.concurrency.clamp(1, Semaphore::MAX_PERMITS);
        let permits = workers
            .keys()
            .map(|backend| (*backend, Arc::new(Semaphore::new(slots))))
            .collect();
        Self {
            inner: Arc::new(DispatcherInner {
                workers,
                coordinator,
                config,
                permits,
                states: DashMap::new(),
            }),
        }
    }

    /// Backends with a registered worker, sorted.
    pub fn backends(&self) -> Vec<BackendId> {
        let mut backends: Vec<_> = self.inner.workers.keys().copied().collect();
        backends.sort();
        backends
    }

    pub fn coordinator(&self) -> &Arc<PropagationCoordinator> {
        &self.inner.coordinator
    }

    /// Queues `job` and returns a handle resolving to its final report.
    pub fn submit(&self, job: PropagationJob) -> PropagationResult<JoinHandle<JobReport>> {
        let worker = self
            .inner
            .workers
            .get(&job.backend)
            .cloned()
            .ok_or(PropagationError::Storage(StorageError::UnknownBackend(job.backend)))?;

        self.inner
            .states
            .insert((job.hash().to_string(), job.backend), JobState::Pending);
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move { inner.run(worker, job).await }))
    }

    /// Queues one job per configured backend for `hash`.
    pub fn propagate(&self, hash: &str) -> Vec<JoinHandle<JobReport>> {
        self.backends()
            .into_iter()
            .filter_map(|backend| self.submit(PropagationJob::new(backend, hash)).ok())
            .collect()
    }

    /// Queues jobs only for the given backends, e.g. the ones still missing a catalog row.
    pub fn propagate_to(
        &self,
        hash: &str,
        backends: impl IntoIterator<Item = BackendId>,
    ) -> PropagationResult<Vec<JoinHandle<JobReport>>> {
        backends
            .into_iter()
            .map(|backend| self.submit(PropagationJob::new(backend, hash)))
            .collect()
    }

    /// Queues staged blobs that still lack a copy in some configured backend.
    ///
    /// Pairs that already have a job (queued, running, backing off, or dead) are
    /// left alone, so calling this repeatedly never duplicates work and dead jobs
    /// wait for an explicit [`Dispatcher::submit`]. Staged files without a blob row
    /// are skipped: their references could not be recorded until whoever staged
    /// them inserts the row.
    pub async fn resume_staged(&self) -> PropagationResult<Vec<JoinHandle<JobReport>>> {
        let coordinator = &self.inner.coordinator;
        let mut handles = Vec::new();

        for hash in coordinator.files().staged_hashes().await? {
            let candidates: Vec<_> = self
                .backends()
                .into_iter()
                .filter(|backend| !self.inner.states.contains_key(&(hash.clone(), *backend)))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            if coordinator.catalog().get_blob(&hash).await?.is_none() {
                tracing::debug!(hash = %hash, "staged blob has no catalog row yet, not queueing it");
                continue;
            }

            let stored: BTreeSet<_> = coordinator
                .catalog()
                .references_for(&hash)
                .await?
                .into_iter()
                .map(|row| row.blob_storage)
                .collect();
            let missing: Vec<_> = candidates
                .into_iter()
                .filter(|backend| !stored.contains(backend))
                .collect();
            if missing.is_empty() {
                continue;
            }

            tracing::info!(hash = %hash, backends = ?missing, "queueing staged blob");
            handles.extend(self.propagate_to(&hash, missing)?);
        }
        Ok(handles)
    }

    /// Deletes a blob everywhere: the catalog rows first, then every stored copy,
    /// then the staged file.
    ///
    /// Driver failures don't stop the deletion; those copies come back in
    /// [`DeletionReport::orphaned`].
    pub async fn delete_blob(&self, hash: &str) -> PropagationResult<DeletionReport> {
        let coordinator = &self.inner.coordinator;
        let rows = coordinator.catalog().delete_blob(hash).await?;

        let mut report = DeletionReport::default();
        for row in rows {
            let reference = row.to_blob_reference();
            let removed = match self.inner.workers.get(&reference.backend) {
                Some(worker) => worker.remove(&reference.reference).await,
                None => Err(StorageError::UnknownBackend(reference.backend).into()),
            };
            match removed {
                Ok(()) => report.removed.push(reference),
                Err(e) => {
                    tracing::warn!(hash, backend = %reference.backend, reference = %reference.reference, error = %e, "couldn't remove blob copy");
                    report.orphaned.push((reference, e));
                }
            }
        }
        report.staging_removed = coordinator.files().remove(hash).await?;

        self.inner.states.retain(|(job_hash, _), _| job_hash != hash);
        tracing::info!(hash, removed = report.removed.len(), orphaned = report.orphaned.len(), "deleted blob");
        Ok(report)
    }

    /// State of an unfinished or dead job. `None` once a job succeeded or if it
    /// was never submitted.
    pub fn state(&self, hash: &str, backend: BackendId) -> Option<JobState> {
        self.inner
            .states
            .get(&(hash.to_string(), backend))
            .map(|state| state.value().clone())
    }

    /// Jobs that ended without a catalog row and need an operator.
    pub fn dead_jobs(&self) -> Vec<(String, BackendId, JobState)> {
        let mut dead: Vec<_> = self
            .inner
            .states
            .iter()
            .filter(|entry| matches!(entry.value(), JobState::Dead { .. }))
            .map(|entry| (entry.key().0.clone(), entry.key().1, entry.value().clone()))
            .collect();
        dead.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        dead
    }

    /// Stops handing out execution slots; jobs still waiting for one end as cancelled.
    pub fn close(&self) {
        for semaphore in self.inner.permits.values() {
            semaphore.close();
        }
    }
}

/// Waits for every handle, dropping jobs whose dispatcher task itself died.
pub async fn join_reports(handles: Vec<JoinHandle<JobReport>>) -> Vec<JobReport> {
    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(e) => tracing::error!(error = %e, "dispatcher task failed"),
        }
    }
    reports
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl DispatcherInner {
    fn set_state(&self, job: &PropagationJob, state: JobState) {
        self.states.insert((job.hash().to_string(), job.backend), state);
    }

    async fn acquire(&self, backend: BackendId) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.permits.get(&backend)?.clone();
        semaphore.acquire_owned().await.ok()
    }

    async fn run(&self, worker: StorageWorker, mut job: PropagationJob) -> JobReport {
        loop {
            let attempt = job.attempts_made + 1;
            // held for the attempt only, never across a backoff
            let Some(permit) = self.acquire(job.backend).await else {
                return self.finish_dead(job, JobFailure::Cancelled);
            };
            self.set_state(&job, JobState::Running { attempt });

            let result = self.execute_attempt(&worker, &job.payload).await;
            drop(permit);
            job.attempts_made = attempt;

            let failure = match result {
                Ok(reference) => match self.record(&job, &reference).await {
                    Ok(()) => {
                        self.states.remove(&(job.hash().to_string(), job.backend));
                        return JobReport { attempts: attempt, job, outcome: Ok(reference) };
                    }
                    Err(e) => JobFailure::Propagation(e),
                },
                Err(failure) => failure,
            };

            // a failed catalog write already retried on its own; only driver-side failures loop here
            let driver_side = !matches!(&failure, JobFailure::Propagation(PropagationError::Catalog(_)));
            if driver_side && failure.is_retryable() && self.config.retry.allows_retry_after(attempt) {
                let delay = self.config.retry.backoff(attempt);
                tracing::warn!(
                    hash = %job.hash(),
                    backend = %job.backend,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %failure,
                    "propagation attempt failed, retrying"
                );
                self.set_state(&job, JobState::Failed { attempt, error: failure.to_string() });
                tokio::time::sleep(delay).await;
                continue;
            }

            return self.finish_dead(job, failure);
        }
    }

    /// One isolated attempt: its own task, bounded by the job timeout.
    async fn execute_attempt(&self, worker: &StorageWorker, payload: &JobPayload) -> Result<BlobReference, JobFailure> {
        let worker = worker.clone();
        let payload = payload.clone();
        let mut handle = tokio::spawn(async move { worker.process(&payload).await });

        match tokio::time::timeout(self.config.job_timeout, &mut handle).await {
            Ok(Ok(result)) => result.map_err(JobFailure::from),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(JobFailure::Panicked(panic_message(join_err.into_panic())))
            }
            Ok(Err(_)) => Err(JobFailure::Cancelled),
            Err(_) => {
                // whatever the driver half-wrote is left as-is; stores converge on retry
                handle.abort();
                Err(JobFailure::TimedOut(self.config.job_timeout))
            }
        }
    }

    /// Records the reference, retrying transient catalog failures without
    /// re-running the worker.
    async fn record(&self, job: &PropagationJob, reference: &BlobReference) -> PropagationResult<()> {
        let mut attempt = 1;
        loop {
            match self.coordinator.record(job.hash(), reference).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && self.config.retry.allows_retry_after(attempt) => {
                    let delay = self.config.retry.backoff(attempt);
                    tracing::warn!(hash = %job.hash(), backend = %job.backend, attempt, error = %e, "catalog write failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn finish_dead(&self, job: PropagationJob, failure: JobFailure) -> JobReport {
        tracing::error!(
            hash = %job.hash(),
            backend = %job.backend,
            attempts = job.attempts_made,
            error = %failure,
            "propagation job is dead"
        );
        self.set_state(&job, JobState::Dead { attempts: job.attempts_made, error: failure.to_string() });
        JobReport { attempts: job.attempts_made, job, outcome: Err(failure) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Blob, BlobDataStorageReference, NewBlob, ReferenceCatalog, RocksCatalog, UpsertOutcome};
    use crate::error::{CatalogError, CatalogResult, ErrorKind};
    use crate::staging::BlobFileManager;
    use async_trait::async_trait;
    use blob_storage_manager::{BlobStorage, StorageResult};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Clone, Copy)]
    enum Behaviour {
        Healthy,
        /// Reports `BackendUnavailable` for the first `n` stores.
        FailFirst(u32),
        Panic,
        Hang,
    }

    /// In-memory driver whose failures are scripted per test.
    #[derive(Debug)]
    struct ScriptedStorage {
        backend: BackendId,
        behaviour: Behaviour,
        calls: AtomicU32,
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl ScriptedStorage {
        fn new(backend: BackendId, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self { backend, behaviour, calls: AtomicU32::new(0), blobs: Mutex::new(HashMap::new()) })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BlobStorage for ScriptedStorage {
        fn backend(&self) -> BackendId {
            self.backend
        }

        async fn store(&self, hash: &str, data: &[u8]) -> StorageResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.behaviour {
                Behaviour::Healthy => {}
                Behaviour::FailFirst(n) if call <= n => {
                    return Err(StorageError::unavailable(self.backend, "503 service unavailable"));
                }
                Behaviour::FailFirst(_) => {}
                Behaviour::Panic => panic!("driver bug"),
                Behaviour::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
            }
            self.blobs.lock().unwrap().insert(hash.to_string(), data.to_vec());
            Ok(format!("{}:{hash}", self.backend))
        }

        async fn retrieve(&self, reference: &str) -> StorageResult<Vec<u8>> {
            let hash = reference.split_once(':').map(|(_, hash)| hash).unwrap_or_default();
            self.blobs
                .lock()
                .unwrap()
                .get(hash)
                .cloned()
                .ok_or_else(|| StorageError::not_found(self.backend, reference))
        }

        async fn remove(&self, _reference: &str) -> StorageResult<()> {
            Ok(())
        }
    }

    /// Delegates to a real catalog but fails the first `n` reference upserts as unreachable.
    struct FlakyCatalog {
        inner: Arc<RocksCatalog>,
        upsert_failures: AtomicU32,
    }

    #[async_trait]
    impl ReferenceCatalog for FlakyCatalog {
        async fn insert_blob(&self, blob: NewBlob) -> CatalogResult<Blob> {
            self.inner.insert_blob(blob).await
        }

        async fn get_blob(&self, hash: &str) -> CatalogResult<Option<Blob>> {
            self.inner.get_blob(hash).await
        }

        async fn set_first_block_number(&self, hash: &str, block_number: u64) -> CatalogResult<Blob> {
            self.inner.set_first_block_number(hash, block_number).await
        }

        async fn delete_blob(&self, hash: &str) -> CatalogResult<Vec<BlobDataStorageReference>> {
            self.inner.delete_blob(hash).await
        }

        async fn upsert_reference(&self, hash: &str, reference: &BlobReference) -> CatalogResult<UpsertOutcome> {
            let fail = self
                .upsert_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(CatalogError::Unavailable("connection reset by peer".to_string()));
            }
            self.inner.upsert_reference(hash, reference).await
        }

        async fn get_reference(&self, hash: &str, backend: BackendId) -> CatalogResult<Option<BlobDataStorageReference>> {
            self.inner.get_reference(hash, backend).await
        }

        async fn references_for(&self, hash: &str) -> CatalogResult<Vec<BlobDataStorageReference>> {
            self.inner.references_for(hash).await
        }
    }

    struct Harness {
        _dirs: (TempDir, TempDir),
        catalog: Arc<RocksCatalog>,
        files: Arc<BlobFileManager>,
        dispatcher: Dispatcher,
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            concurrency: 4,
            job_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                multiplier: 2.0,
                max_backoff: Duration::from_millis(5),
            },
        }
    }

    async fn harness(storages: Vec<Arc<ScriptedStorage>>, config: DispatcherConfig) -> Harness {
        harness_with_upsert_failures(storages, config, 0).await
    }

    async fn harness_with_upsert_failures(
        storages: Vec<Arc<ScriptedStorage>>,
        config: DispatcherConfig,
        upsert_failures: u32,
    ) -> Harness {
        let catalog_dir = tempdir().unwrap();
        let staging_dir = tempdir().unwrap();
        let catalog = Arc::new(RocksCatalog::open(catalog_dir.path()).unwrap());
        let files = Arc::new(BlobFileManager::new(staging_dir.path()).await.unwrap());
        let flaky = Arc::new(FlakyCatalog { inner: catalog.clone(), upsert_failures: AtomicU32::new(upsert_failures) });

        let required: Vec<_> = storages.iter().map(|storage| storage.backend).collect();
        let coordinator = Arc::new(PropagationCoordinator::new(flaky, files.clone(), required));
        let workers = storages
            .into_iter()
            .map(|storage| StorageWorker::new(storage, files.clone()));
        let dispatcher = Dispatcher::new(workers, coordinator, config);
        Harness { _dirs: (catalog_dir, staging_dir), catalog, files, dispatcher }
    }

    async fn stage(harness: &Harness, hash: &str, data: &[u8]) {
        harness.files.create(hash, data).await.unwrap();
        harness
            .catalog
            .insert_blob(NewBlob {
                versioned_hash: hash.to_string(),
                commitment: "test-commitment".to_string(),
                size: data.len() as u64,
                first_block_number: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let flaky = ScriptedStorage::new(BackendId::ObjectStore, Behaviour::FailFirst(2));
        let harness = harness(vec![flaky.clone()], fast_config()).await;
        stage(&harness, "0xabc", b"hello-blob").await;

        let handle = harness.dispatcher.submit(PropagationJob::new(BackendId::ObjectStore, "0xabc")).unwrap();
        let report = handle.await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.attempts, 3);
        assert_eq!(flaky.calls(), 3);
        // finished jobs leave the state table; the catalog row is what remains
        assert_eq!(harness.dispatcher.state("0xabc", BackendId::ObjectStore), None);
        assert!(harness.catalog.get_reference("0xabc", BackendId::ObjectStore).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_state_table_only_keeps_unfinished_work() {
        let healthy = ScriptedStorage::new(BackendId::Database, Behaviour::Healthy);
        let harness = harness(vec![healthy], fast_config()).await;
        for i in 0..20 {
            stage(&harness, &format!("0x{i:02}"), b"blob").await;
        }

        let handles = (0..20)
            .map(|i| harness.dispatcher.submit(PropagationJob::new(BackendId::Database, format!("0x{i:02}"))).unwrap())
            .collect();
        let reports = join_reports(handles).await;
        assert!(reports.iter().all(JobReport::is_success));

        let dead = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::Database, "0xmissing"))
            .unwrap()
            .await
            .unwrap();
        assert!(!dead.is_success());

        assert_eq!(harness.dispatcher.inner.states.len(), 1);
        assert_eq!(harness.dispatcher.dead_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_catalog_write_is_retried_without_new_upload() {
        let storage = ScriptedStorage::new(BackendId::Database, Behaviour::Healthy);
        let harness = harness_with_upsert_failures(vec![storage.clone()], fast_config(), 2).await;
        stage(&harness, "0xabc", b"hello-blob").await;

        let report = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::Database, "0xabc"))
            .unwrap()
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.attempts, 1);
        assert_eq!(storage.calls(), 1);
        let row = harness.catalog.get_reference("0xabc", BackendId::Database).await.unwrap().unwrap();
        assert_eq!(row.data_reference, "DATABASE:0xabc");
    }

    #[tokio::test]
    async fn test_reference_conflict_is_dead_after_one_attempt() {
        let storage = ScriptedStorage::new(BackendId::Database, Behaviour::Healthy);
        let harness = harness(vec![storage.clone()], fast_config()).await;
        stage(&harness, "0xabc", b"hello-blob").await;
        harness
            .catalog
            .upsert_reference("0xabc", &BlobReference::new(BackendId::Database, "recorded-earlier"))
            .await
            .unwrap();

        let report = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::Database, "0xabc"))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(storage.calls(), 1);
        match &report.outcome {
            Err(JobFailure::Propagation(e)) => assert_eq!(e.kind(), ErrorKind::ReferenceConflict),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            harness.dispatcher.state("0xabc", BackendId::Database),
            Some(JobState::Dead { attempts: 1, .. })
        ));
        let row = harness.catalog.get_reference("0xabc", BackendId::Database).await.unwrap().unwrap();
        assert_eq!(row.data_reference, "recorded-earlier");
    }

    #[tokio::test]
    async fn test_hung_backend_does_not_starve_others() {
        let hung = ScriptedStorage::new(BackendId::ObjectStore, Behaviour::Hang);
        let healthy = ScriptedStorage::new(BackendId::Database, Behaviour::Healthy);
        let config = DispatcherConfig {
            concurrency: 1,
            job_timeout: Duration::from_secs(30),
            ..fast_config()
        };
        let harness = harness(vec![hung, healthy], config).await;
        for hash in ["0x01", "0x02", "0x03"] {
            stage(&harness, hash, b"blob").await;
        }

        let _stuck = [
            harness.dispatcher.submit(PropagationJob::new(BackendId::ObjectStore, "0x01")).unwrap(),
            harness.dispatcher.submit(PropagationJob::new(BackendId::ObjectStore, "0x02")).unwrap(),
        ];
        let healthy_job = harness.dispatcher.submit(PropagationJob::new(BackendId::Database, "0x03")).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), healthy_job)
            .await
            .expect("database job waited on the object store")
            .unwrap();
        assert!(report.is_success());
        assert_eq!(harness.dispatcher.state("0x02", BackendId::ObjectStore), Some(JobState::Pending));
    }

    #[tokio::test]
    async fn test_slot_is_released_during_backoff() {
        let flaky = ScriptedStorage::new(BackendId::Swarm, Behaviour::FailFirst(1));
        let config = DispatcherConfig {
            concurrency: 1,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_secs(30),
                multiplier: 1.0,
                max_backoff: Duration::from_secs(30),
            },
            ..fast_config()
        };
        let harness = harness(vec![flaky.clone()], config).await;
        stage(&harness, "0x01", b"first").await;
        stage(&harness, "0x02", b"second").await;

        let _backing_off = harness.dispatcher.submit(PropagationJob::new(BackendId::Swarm, "0x01")).unwrap();
        let second = harness.dispatcher.submit(PropagationJob::new(BackendId::Swarm, "0x02")).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("second job waited out the first one's backoff")
            .unwrap();
        assert!(report.is_success());
        assert_eq!(flaky.calls(), 2);
        assert!(matches!(
            harness.dispatcher.state("0x01", BackendId::Swarm),
            Some(JobState::Failed { attempt: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let down = ScriptedStorage::new(BackendId::Swarm, Behaviour::FailFirst(u32::MAX));
        let harness = harness(vec![down.clone()], fast_config()).await;
        stage(&harness, "0xabc", b"hello-blob").await;

        let report = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::Swarm, "0xabc"))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(down.calls(), 3);
        match report.outcome {
            Err(JobFailure::Propagation(e)) => assert_eq!(e.kind(), ErrorKind::BackendUnavailable),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            harness.dispatcher.state("0xabc", BackendId::Swarm),
            Some(JobState::Dead { attempts: 3, .. })
        ));
        assert_eq!(harness.dispatcher.dead_jobs().len(), 1);
        // the blob has no copy anywhere, so its staged file must survive
        assert!(harness.files.exists("0xabc").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_staged_file_is_not_retried() {
        let healthy = ScriptedStorage::new(BackendId::Database, Behaviour::Healthy);
        let harness = harness(vec![healthy.clone()], fast_config()).await;

        let report = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::Database, "0xmissing"))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(healthy.calls(), 0);
        match &report.outcome {
            Err(JobFailure::Propagation(e)) => {
                assert_eq!(e.kind(), ErrorKind::StagingFileMissing);
                assert_eq!(e.hash(), Some("0xmissing"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(harness.catalog.references_for("0xmissing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_driver_is_isolated() {
        let broken = ScriptedStorage::new(BackendId::Swarm, Behaviour::Panic);
        let healthy = ScriptedStorage::new(BackendId::Filesystem, Behaviour::Healthy);
        let harness = harness(vec![broken, healthy], fast_config()).await;
        stage(&harness, "0xabc", b"hello-blob").await;

        let reports = join_reports(harness.dispatcher.propagate("0xabc")).await;
        assert_eq!(reports.len(), 2);

        let by_backend: HashMap<_, _> = reports.iter().map(|report| (report.job.backend, report)).collect();
        assert!(by_backend[&BackendId::Filesystem].is_success());
        match &by_backend[&BackendId::Swarm].outcome {
            Err(JobFailure::Panicked(message)) => assert!(message.contains("driver bug")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(by_backend[&BackendId::Swarm].attempts, 1);

        // the dispatcher keeps working after the panic
        stage(&harness, "0xdef", b"more").await;
        let report = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::Filesystem, "0xdef"))
            .unwrap()
            .await
            .unwrap();
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_hung_attempt_times_out() {
        let hung = ScriptedStorage::new(BackendId::ObjectStore, Behaviour::Hang);
        let config = DispatcherConfig {
            job_timeout: Duration::from_millis(50),
            retry: RetryPolicy { max_attempts: 2, initial_backoff: Duration::from_millis(1), ..RetryPolicy::default() },
            ..fast_config()
        };
        let harness = harness(vec![hung.clone()], config).await;
        stage(&harness, "0xabc", b"hello-blob").await;

        let report = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::ObjectStore, "0xabc"))
            .unwrap()
            .await
            .unwrap();

        assert!(matches!(report.outcome, Err(JobFailure::TimedOut(_))));
        assert_eq!(report.attempts, 2);
        assert_eq!(hung.calls(), 2);
    }

    #[tokio::test]
    async fn test_resume_picks_up_unfinished_blobs() {
        let harness = harness(vec![ScriptedStorage::new(BackendId::Database, Behaviour::Healthy)], fast_config()).await;
        stage(&harness, "0xabc", b"hello-blob").await;
        // staged but never announced to the catalog
        harness.files.create("0xorphan", b"orphan").await.unwrap();

        let handles = harness.dispatcher.resume_staged().await.unwrap();
        let reports = join_reports(handles).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].job.hash(), "0xabc");
        assert!(reports[0].is_success());

        assert!(harness.dispatcher.resume_staged().await.unwrap().is_empty());
        assert!(harness.files.exists("0xorphan").await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_skips_queued_and_dead_jobs() {
        let hung = ScriptedStorage::new(BackendId::ObjectStore, Behaviour::Hang);
        let harness = harness(vec![hung], fast_config()).await;
        stage(&harness, "0xabc", b"hello-blob").await;

        let first = harness.dispatcher.resume_staged().await.unwrap();
        assert_eq!(first.len(), 1);
        // the first job is still in flight
        assert!(harness.dispatcher.resume_staged().await.unwrap().is_empty());

        // a dead job stays put until someone resubmits it
        let gone = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::ObjectStore, "0xdead"))
            .unwrap()
            .await
            .unwrap();
        assert!(!gone.is_success());
        stage(&harness, "0xdead", b"late").await;
        assert!(harness.dispatcher.resume_staged().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_every_copy() {
        let storage = ScriptedStorage::new(BackendId::Database, Behaviour::Healthy);
        let harness = harness(vec![storage.clone()], fast_config()).await;
        stage(&harness, "0xabc", b"hello-blob").await;
        // recorded for a backend this node has no driver for
        harness
            .catalog
            .upsert_reference("0xabc", &BlobReference::new(BackendId::Swarm, "a".repeat(64)))
            .await
            .unwrap();
        let reports = join_reports(harness.dispatcher.propagate("0xabc")).await;
        assert!(reports.iter().all(JobReport::is_success));

        let report = harness.dispatcher.delete_blob("0xabc").await.unwrap();

        assert_eq!(report.removed, vec![BlobReference::new(BackendId::Database, "DATABASE:0xabc")]);
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].0.backend, BackendId::Swarm);
        assert_eq!(report.orphaned[0].1.kind(), ErrorKind::UnknownBackend);
        assert!(harness.catalog.get_blob("0xabc").await.unwrap().is_none());
        assert!(harness.catalog.references_for("0xabc").await.unwrap().is_empty());
        assert_eq!(
            harness.dispatcher.delete_blob("0xabc").await.unwrap_err().kind(),
            ErrorKind::Catalog
        );
    }

    #[tokio::test]
    async fn test_oversized_concurrency_is_clamped() {
        let config = DispatcherConfig { concurrency: usize::MAX, ..fast_config() };
        let harness = harness(vec![ScriptedStorage::new(BackendId::Database, Behaviour::Healthy)], config).await;
        stage(&harness, "0xabc", b"hello-blob").await;

        let report = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::Database, "0xabc"))
            .unwrap()
            .await
            .unwrap();
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_unknown_backend_is_rejected() {
        let harness = harness(vec![ScriptedStorage::new(BackendId::Database, Behaviour::Healthy)], fast_config()).await;

        let err = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::Swarm, "0xabc"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownBackend);
        assert_eq!(harness.dispatcher.backends(), vec![BackendId::Database]);
    }

    #[tokio::test]
    async fn test_closed_dispatcher_cancels_waiting_jobs() {
        let harness = harness(vec![ScriptedStorage::new(BackendId::Database, Behaviour::Healthy)], fast_config()).await;
        stage(&harness, "0xabc", b"hello-blob").await;
        harness.dispatcher.close();

        let report = harness
            .dispatcher
            .submit(PropagationJob::new(BackendId::Database, "0xabc"))
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(report.outcome, Err(JobFailure::Cancelled)));
    }
}

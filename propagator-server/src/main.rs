mod errors;
mod params;

use std::sync::Arc;
use std::time::Duration;

use blob_propagator::{
    join_reports, BlobFileManager, Dispatcher, DispatcherConfig, JobReport, PropagationCoordinator, RetryPolicy,
    RocksCatalog, StorageWorker,
};
use blob_storage_manager::database_store::DatabaseBlobStorage;
use blob_storage_manager::local_store::FilesystemBlobStorage;
use blob_storage_manager::object_store::{ObjectStoreBlobStorage, ObjectStoreConfig};
use blob_storage_manager::swarm_store::SwarmBlobStorage;
use blob_storage_manager::{BackendId, BlobStorage, BlobStorageManager};
use clap::Parser;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::errors::ServerError;
use crate::params::Args;

fn missing(backend: BackendId, setting: &'static str) -> ServerError {
    ServerError::MissingSetting { backend, setting }
}

async fn build_driver(args: &Args, backend: BackendId) -> Result<Arc<dyn BlobStorage>, ServerError> {
    let driver: Arc<dyn BlobStorage> = match backend {
        BackendId::Filesystem => {
            let root = args.fs_root.clone().ok_or_else(|| missing(backend, "--fs-root"))?;
            Arc::new(FilesystemBlobStorage::new(root).await?)
        }
        BackendId::Database => {
            let path = args.db_path.as_ref().ok_or_else(|| missing(backend, "--db-path"))?;
            Arc::new(DatabaseBlobStorage::open(path)?)
        }
        BackendId::ObjectStore => {
            let bucket = args.s3_bucket.clone().ok_or_else(|| missing(backend, "--s3-bucket"))?;
            let config = ObjectStoreConfig {
                bucket,
                endpoint_url: args.s3_endpoint.clone(),
                region: args.s3_region.clone(),
                chain_id: args.chain_id,
                force_path_style: args.s3_path_style,
            };
            Arc::new(ObjectStoreBlobStorage::connect(&config).await)
        }
        BackendId::Swarm => {
            let url = args.swarm_url.clone().ok_or_else(|| missing(backend, "--swarm-url"))?;
            let batch_id = args
                .swarm_batch_id
                .clone()
                .ok_or_else(|| missing(backend, "--swarm-batch-id"))?;
            Arc::new(SwarmBlobStorage::new(url, batch_id))
        }
    };
    Ok(driver)
}

async fn build_manager(args: &Args) -> Result<BlobStorageManager, ServerError> {
    if args.backends.is_empty() {
        return Err(ServerError::NoBackends);
    }
    let mut manager = BlobStorageManager::new();
    for backend in &args.backends {
        manager.register(build_driver(args, *backend).await?);
        tracing::info!(%backend, "storage backend configured");
    }
    Ok(manager)
}

fn dispatcher_config(args: &Args) -> DispatcherConfig {
    DispatcherConfig {
        concurrency: args.concurrency as usize,
        job_timeout: Duration::from_secs(args.job_timeout_secs),
        retry: RetryPolicy {
            max_attempts: args.max_attempts.max(1),
            initial_backoff: Duration::from_millis(args.initial_backoff_ms),
            max_backoff: Duration::from_millis(args.max_backoff_ms),
            ..RetryPolicy::default()
        },
    }
}

async fn log_reports(handles: Vec<JoinHandle<JobReport>>) {
    let reports = join_reports(handles).await;
    let failed = reports.iter().filter(|report| !report.is_success()).count();
    tracing::info!(jobs = reports.len(), failed, "queued propagation finished");
}

/// Queues staged blobs that still miss a copy, once now and then every `every` if set.
///
/// Blobs staged while the process runs reach the dispatcher this way; pairs that
/// are already queued or dead are skipped by [`Dispatcher::resume_staged`].
fn spawn_resumer(dispatcher: Dispatcher, every: Option<Duration>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match dispatcher.resume_staged().await {
                Ok(handles) if !handles.is_empty() => {
                    tokio::spawn(log_reports(handles));
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "couldn't scan staged blobs"),
            }
            let Some(every) = every else {
                break;
            };
            tokio::time::sleep(every).await;
        }
    })
}

/// Periodically drops staged files that some backend already holds.
fn spawn_sweeper(coordinator: Arc<PropagationCoordinator>, every: Duration, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = coordinator.sweep(grace).await {
                tracing::error!(error = %e, "staging sweep failed");
            }
        }
    })
}

async fn run(args: Args) -> Result<(), ServerError> {
    let manager = build_manager(&args).await?;
    let required = args.required_backends.clone().unwrap_or_else(|| args.backends.clone());
    if let Some(backend) = required.iter().find(|backend| !args.backends.contains(backend)) {
        return Err(ServerError::RequiredNotConfigured(*backend));
    }

    let files = Arc::new(BlobFileManager::new(&args.staging_dir).await?);
    let catalog = Arc::new(RocksCatalog::open(&args.catalog_path)?);
    let coordinator = Arc::new(PropagationCoordinator::new(catalog.clone(), files.clone(), required));
    let dispatcher = Dispatcher::new(
        StorageWorker::all_from(&manager, files.clone()),
        coordinator.clone(),
        dispatcher_config(&args),
    );
    tracing::info!(
        staging_dir = %files.directory().display(),
        backends = ?dispatcher.backends(),
        required = ?coordinator.required_backends(),
        "blob propagator started"
    );

    let resumer = spawn_resumer(
        dispatcher.clone(),
        (args.resume_interval_secs > 0).then(|| Duration::from_secs(args.resume_interval_secs)),
    );

    let sweeper = (args.sweep_interval_secs > 0).then(|| {
        spawn_sweeper(
            coordinator.clone(),
            Duration::from_secs(args.sweep_interval_secs),
            Duration::from_secs(args.sweep_grace_secs),
        )
    });

    tokio::signal::ctrl_c().await.map_err(ServerError::Signal)?;
    tracing::info!("shutting down");

    dispatcher.close();
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    resumer.abort();

    let dead = dispatcher.dead_jobs();
    if !dead.is_empty() {
        tracing::warn!(count = dead.len(), "propagation jobs ended dead this run");
    }
    catalog.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "blob propagator stopped");
        return Err(e.into());
    }
    Ok(())
}

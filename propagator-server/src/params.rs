use std::path::PathBuf;

use blob_storage_manager::BackendId;
use clap::Parser;

/// Propagates staged blobs into every configured storage backend.
#[derive(Parser, Debug)]
#[clap(version)]
pub struct Args {
    /// Directory holding staged `<hash>.bin` files.
    #[clap(long, env = "PROPAGATOR_STAGING_DIR")]
    pub(crate) staging_dir: PathBuf,
    /// RocksDB directory of the reference catalog.
    #[clap(long, env = "PROPAGATOR_CATALOG_PATH")]
    pub(crate) catalog_path: PathBuf,

    /// Backends to propagate to, comma separated.
    #[clap(long, env = "PROPAGATOR_BACKENDS", value_delimiter = ',', required = true)]
    pub(crate) backends: Vec<BackendId>,
    /// Backends that must hold a copy before a staged file is removed. Defaults to `--backends`.
    #[clap(long, env = "PROPAGATOR_REQUIRED_BACKENDS", value_delimiter = ',')]
    pub(crate) required_backends: Option<Vec<BackendId>>,

    #[clap(long, env = "PROPAGATOR_FS_ROOT")]
    pub(crate) fs_root: Option<PathBuf>,
    #[clap(long, env = "PROPAGATOR_DB_PATH")]
    pub(crate) db_path: Option<PathBuf>,

    #[clap(long, env = "PROPAGATOR_S3_BUCKET")]
    pub(crate) s3_bucket: Option<String>,
    #[clap(long, env = "PROPAGATOR_S3_ENDPOINT")]
    pub(crate) s3_endpoint: Option<String>,
    #[clap(long, env = "PROPAGATOR_S3_REGION")]
    pub(crate) s3_region: Option<String>,
    #[clap(long, env = "PROPAGATOR_S3_PATH_STYLE", default_value_t = false)]
    pub(crate) s3_path_style: bool,
    /// First segment of every object key.
    #[clap(long, env = "PROPAGATOR_CHAIN_ID", default_value_t = 1)]
    pub(crate) chain_id: u64,

    /// Bee gateway, e.g. `http://bee:1633`.
    #[clap(long, env = "PROPAGATOR_SWARM_URL")]
    pub(crate) swarm_url: Option<String>,
    #[clap(long, env = "PROPAGATOR_SWARM_BATCH_ID")]
    pub(crate) swarm_batch_id: Option<String>,

    /// Attempts running at once against each backend.
    #[clap(long, env = "PROPAGATOR_CONCURRENCY", default_value_t = 16, value_parser = clap::value_parser!(u32).range(1..=4096))]
    pub(crate) concurrency: u32,
    #[clap(long, env = "PROPAGATOR_JOB_TIMEOUT_SECS", default_value_t = 60)]
    pub(crate) job_timeout_secs: u64,
    #[clap(long, env = "PROPAGATOR_MAX_ATTEMPTS", default_value_t = 5)]
    pub(crate) max_attempts: u32,
    #[clap(long, env = "PROPAGATOR_INITIAL_BACKOFF_MS", default_value_t = 500)]
    pub(crate) initial_backoff_ms: u64,
    #[clap(long, env = "PROPAGATOR_MAX_BACKOFF_MS", default_value_t = 30_000)]
    pub(crate) max_backoff_ms: u64,

    /// Seconds between scans of the staging directory for blobs still missing a copy;
    /// 0 scans once at startup only.
    #[clap(long, env = "PROPAGATOR_RESUME_INTERVAL_SECS", default_value_t = 10)]
    pub(crate) resume_interval_secs: u64,

    /// Seconds between staging sweeps; 0 disables the sweep.
    #[clap(long, env = "PROPAGATOR_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub(crate) sweep_interval_secs: u64,
    /// Minimum age of a staged file before the sweep may remove it.
    #[clap(long, env = "PROPAGATOR_SWEEP_GRACE_SECS", default_value_t = 3600)]
    pub(crate) sweep_grace_secs: u64,
}

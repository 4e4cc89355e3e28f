use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;

use crate::error::{PropagationError, PropagationResult};

const STAGED_EXTENSION: &str = "bin";
const TEMP_SUFFIX: &str = ".tmp";

/// Content-addressed holding area for blob bytes awaiting propagation.
///
/// Files are written once and never mutated, so any number of workers may
/// read the same hash concurrently. Removal is idempotent.
#[derive(Debug, Clone)]
pub struct BlobFileManager {
    directory: PathBuf,
}

/// Rejects anything that could resolve outside the staging directory.
pub fn validate_hash(hash: &str) -> PropagationResult<()> {
    let bad = hash.is_empty()
        || hash.contains(&['/', '\\', '\0'][..])
        || hash.starts_with('.');
    if bad {
        return Err(PropagationError::InvalidHash(hash.to_string()));
    }
    Ok(())
}

impl BlobFileManager {
    /// Creates the manager and its directory.
    pub async fn new(directory: impl Into<PathBuf>) -> PropagationResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await.map_err(|e| {
            PropagationError::io(format!("couldn't create staging directory {}", directory.display()), e)
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, hash: &str) -> PropagationResult<PathBuf> {
        validate_hash(hash)?;
        Ok(self.directory.join(format!("{hash}.{STAGED_EXTENSION}")))
    }

    /// Writes the payload for `hash`, replacing any earlier file.
    ///
    /// The bytes land in a temporary file first and are renamed into place,
    /// so readers never see a partially written blob.
    pub async fn create(&self, hash: &str, data: &[u8]) -> PropagationResult<()> {
        let path = self.path_for(hash)?;
        let tmp = self.directory.join(format!(".{hash}.{}{TEMP_SUFFIX}", uuid::Uuid::new_v4()));

        fs::write(&tmp, data)
            .await
            .map_err(|e| PropagationError::io(format!("couldn't write blob {hash} data file"), e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(PropagationError::io(format!("couldn't write blob {hash} data file"), e));
        }
        tracing::debug!(hash, bytes = data.len(), "staged blob data file");
        Ok(())
    }

    pub async fn read(&self, hash: &str) -> PropagationResult<Vec<u8>> {
        let path = self.path_for(hash)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PropagationError::StagingFileMissing { hash: hash.to_string() })
            }
            Err(e) => Err(PropagationError::io(format!("couldn't read blob {hash} data file"), e)),
        }
    }

    pub async fn exists(&self, hash: &str) -> PropagationResult<bool> {
        let path = self.path_for(hash)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| PropagationError::io(format!("couldn't stat blob {hash} data file"), e))
    }

    /// Deletes the file for `hash`. Returns `false` if there was nothing to delete.
    pub async fn remove(&self, hash: &str) -> PropagationResult<bool> {
        let path = self.path_for(hash)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(hash, "removed blob data file");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PropagationError::io(format!("couldn't remove blob {hash} data file"), e)),
        }
    }

    /// Every hash that currently has a staged file, sorted.
    pub async fn staged_hashes(&self) -> PropagationResult<Vec<String>> {
        Ok(self.scan().await?.into_iter().map(|(hash, _)| hash).collect())
    }

    /// Hashes whose files were last written no later than `cutoff`.
    pub async fn staged_before(&self, cutoff: SystemTime) -> PropagationResult<Vec<String>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|(_, modified)| *modified <= cutoff)
            .map(|(hash, _)| hash)
            .collect())
    }

    async fn scan(&self) -> PropagationResult<Vec<(String, SystemTime)>> {
        let context = || format!("couldn't list staging directory {}", self.directory.display());
        let mut entries = fs::read_dir(&self.directory)
            .await
            .map_err(|e| PropagationError::io(context(), e))?;

        let mut staged = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| PropagationError::io(context(), e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STAGED_EXTENSION) {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if validate_hash(hash).is_err() {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // removed between listing and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(PropagationError::io(context(), e)),
            };
            let modified = metadata.modified().map_err(|e| PropagationError::io(context(), e))?;
            staged.push((hash.to_string(), modified));
        }
        staged.sort();
        Ok(staged)
    }

    /// Deletes temp files of writes that never reached the rename (a crash mid
    /// `create`) and were last touched no later than `cutoff`.
    pub async fn remove_abandoned_writes(&self, cutoff: SystemTime) -> PropagationResult<usize> {
        let context = || format!("couldn't list staging directory {}", self.directory.display());
        let mut entries = fs::read_dir(&self.directory)
            .await
            .map_err(|e| PropagationError::io(context(), e))?;

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| PropagationError::io(context(), e))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !(name.starts_with('.') && name.ends_with(TEMP_SUFFIX)) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|metadata| metadata.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(PropagationError::io(context(), e)),
            };
            if modified > cutoff {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    tracing::warn!(file = name, "removed abandoned staging write");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(PropagationError::io(format!("couldn't remove {name}"), e)),
            }
        }
        Ok(removed)
    }
}

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::backend::BackendId;
use crate::error::{StorageError, StorageResult};
use crate::store::BlobStorage;

/// A `BlobStorage` that writes blobs into a directory on a local volume.
///
/// The reference is the file name relative to the root, so the root can be
/// remounted elsewhere without invalidating catalog rows.
#[derive(Clone, Debug)]
pub struct FilesystemBlobStorage {
    directory: PathBuf,
}

impl FilesystemBlobStorage {
    /// Creates a new `FilesystemBlobStorage` rooted at `directory`, creating it if needed.
    pub async fn new(directory: impl Into<PathBuf>) -> StorageResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .await
            .map_err(|e| StorageError::unavailable(BackendId::Filesystem, e))?;
        Ok(Self { directory })
    }

    fn reference_for(hash: &str) -> String {
        format!("{hash}.bin")
    }

    /// Resolves a reference to a path, refusing anything that would escape the root.
    fn path_for(&self, reference: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(reference);
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.directory.join(relative)),
            _ => Err(StorageError::not_found(BackendId::Filesystem, reference)),
        }
    }
}

#[async_trait]
impl BlobStorage for FilesystemBlobStorage {
    fn backend(&self) -> BackendId {
        BackendId::Filesystem
    }

    async fn store(&self, hash: &str, data: &[u8]) -> StorageResult<String> {
        let reference = Self::reference_for(hash);
        let path = self.path_for(&reference)?;
        fs::write(&path, data)
            .await
            .map_err(|e| StorageError::unavailable(BackendId::Filesystem, e))?;
        tracing::debug!(path = %path.display(), bytes = data.len(), "wrote blob to filesystem storage");
        Ok(reference)
    }

    async fn retrieve(&self, reference: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(reference)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::not_found(BackendId::Filesystem, reference))
            }
            Err(e) => Err(StorageError::unavailable(BackendId::Filesystem, e)),
        }
    }

    async fn remove(&self, reference: &str) -> StorageResult<()> {
        let path = self.path_for(reference)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::unavailable(BackendId::Filesystem, e)),
        }
    }
}

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};

use crate::backend::BackendId;
use crate::error::{StorageError, StorageResult};
use crate::store::BlobStorage;

const BLOB_DATA_CF: &str = "blob_data";

/// A `BlobStorage` that keeps blob bytes in a RocksDB column, keyed by versioned hash.
///
/// The reference handed back is the hash itself.
#[derive(Clone, Debug)]
pub struct DatabaseBlobStorage {
    db: Arc<DB>,
}

impl DatabaseBlobStorage {
    /// Opens (or creates) the database at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let blob_data = ColumnFamilyDescriptor::new(BLOB_DATA_CF, Options::default());
        let db = DB::open_cf_descriptors(&db_opts, db_path, vec![blob_data])
            .map_err(|e| StorageError::unavailable(BackendId::Database, e))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn blob_data(&self) -> StorageResult<&ColumnFamily> {
        self.db
            .cf_handle(BLOB_DATA_CF)
            .ok_or_else(|| StorageError::unavailable(BackendId::Database, "blob_data column family is missing"))
    }
}

#[async_trait]
impl BlobStorage for DatabaseBlobStorage {
    fn backend(&self) -> BackendId {
        BackendId::Database
    }

    async fn store(&self, hash: &str, data: &[u8]) -> StorageResult<String> {
        self.db
            .put_cf(self.blob_data()?, hash.as_bytes(), data)
            .map_err(|e| StorageError::unavailable(BackendId::Database, e))?;
        Ok(hash.to_string())
    }

    async fn retrieve(&self, reference: &str) -> StorageResult<Vec<u8>> {
        self.db
            .get_cf(self.blob_data()?, reference.as_bytes())
            .map_err(|e| StorageError::unavailable(BackendId::Database, e))?
            .ok_or_else(|| StorageError::not_found(BackendId::Database, reference))
    }

    async fn remove(&self, reference: &str) -> StorageResult<()> {
        self.db
            .delete_cf(self.blob_data()?, reference.as_bytes())
            .map_err(|e| StorageError::unavailable(BackendId::Database, e))
    }
}

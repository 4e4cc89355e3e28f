use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use blob_storage_manager::{BackendId, BlobReference};
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::catalog::types::{Blob, BlobDataStorageReference, NewBlob, UpsertOutcome};
use crate::catalog::ReferenceCatalog;
use crate::error::{CatalogError, CatalogResult};

const BLOBS_CF: &str = "blobs";
const REFERENCES_CF: &str = "references";

/// Builds the `references` key; the NUL separator keeps one hash from prefixing another.
fn reference_key(hash: &str, backend: BackendId) -> Vec<u8> {
    let mut key = reference_prefix(hash);
    key.extend_from_slice(backend.as_str().as_bytes());
    key
}

fn reference_prefix(hash: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(hash.len() + 16);
    key.extend_from_slice(hash.as_bytes());
    key.push(0);
    key
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CatalogResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> CatalogResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// A [`ReferenceCatalog`] persisted in RocksDB.
///
/// The `(hash, backend)` uniqueness constraint falls out of the key layout;
/// read-check-write sequences are serialized by `write_lock` so two upserts
/// for the same key can never both observe "absent".
#[derive(Debug)]
pub struct RocksCatalog {
    db: Arc<DB>,
    write_lock: Mutex<()>,
}

impl RocksCatalog {
    /// Opens (or creates) the catalog database at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> CatalogResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let blobs = ColumnFamilyDescriptor::new(BLOBS_CF, Options::default());
        let references = ColumnFamilyDescriptor::new(REFERENCES_CF, Options::default());

        let db = DB::open_cf_descriptors(&db_opts, db_path, vec![blobs, references])?;
        Ok(Self { db: Arc::new(db), write_lock: Mutex::new(()) })
    }

    /// Flushes the write-ahead log so every acknowledged write survives a crash.
    pub fn flush(&self) -> CatalogResult<()> {
        self.db.flush_wal(true)?;
        Ok(())
    }

    fn blobs(&self) -> CatalogResult<&ColumnFamily> {
        self.db.cf_handle(BLOBS_CF).ok_or(CatalogError::MissingColumnFamily(BLOBS_CF))
    }

    fn references(&self) -> CatalogResult<&ColumnFamily> {
        self.db
            .cf_handle(REFERENCES_CF)
            .ok_or(CatalogError::MissingColumnFamily(REFERENCES_CF))
    }

    fn read_blob(&self, hash: &str) -> CatalogResult<Option<Blob>> {
        self.db
            .get_cf(self.blobs()?, hash.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn read_references(&self, hash: &str) -> CatalogResult<Vec<BlobDataStorageReference>> {
        let prefix = reference_prefix(hash);
        let mut rows = Vec::new();
        for res in self
            .db
            .iterator_cf(self.references()?, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = res?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(decode::<BlobDataStorageReference>(&value)?);
        }
        rows.sort_by_key(|row| row.blob_storage);
        Ok(rows)
    }
}

#[async_trait]
impl ReferenceCatalog for RocksCatalog {
    async fn insert_blob(&self, blob: NewBlob) -> CatalogResult<Blob> {
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.read_blob(&blob.versioned_hash)? {
            return Ok(existing);
        }

        let row = Blob::from_new(blob, Utc::now());
        self.db
            .put_cf(self.blobs()?, row.versioned_hash.as_bytes(), encode(&row)?)?;
        tracing::debug!(hash = %row.versioned_hash, size = row.size, "inserted blob row");
        Ok(row)
    }

    async fn get_blob(&self, hash: &str) -> CatalogResult<Option<Blob>> {
        self.read_blob(hash)
    }

    async fn set_first_block_number(&self, hash: &str, block_number: u64) -> CatalogResult<Blob> {
        let _guard = self.write_lock.lock().await;
        let mut row = self
            .read_blob(hash)?
            .ok_or_else(|| CatalogError::BlobNotFound(hash.to_string()))?;
        if row.first_block_number == Some(block_number) {
            return Ok(row);
        }

        if let Some(previous) = row.first_block_number {
            tracing::warn!(hash, previous, block_number, "replacing first block number of blob");
        }
        row.first_block_number = Some(block_number);
        row.updated_at = Utc::now();
        self.db.put_cf(self.blobs()?, hash.as_bytes(), encode(&row)?)?;
        Ok(row)
    }

    async fn delete_blob(&self, hash: &str) -> CatalogResult<Vec<BlobDataStorageReference>> {
        let _guard = self.write_lock.lock().await;
        if self.read_blob(hash)?.is_none() {
            return Err(CatalogError::BlobNotFound(hash.to_string()));
        }

        let removed = self.read_references(hash)?;
        let mut batch = WriteBatch::default();
        for row in &removed {
            batch.delete_cf(self.references()?, reference_key(hash, row.blob_storage));
        }
        batch.delete_cf(self.blobs()?, hash.as_bytes());
        self.db.write(batch)?;
        tracing::info!(hash, references = removed.len(), "deleted blob from catalog");
        Ok(removed)
    }

    async fn upsert_reference(&self, hash: &str, reference: &BlobReference) -> CatalogResult<UpsertOutcome> {
        let _guard = self.write_lock.lock().await;
        if self.read_blob(hash)?.is_none() {
            return Err(CatalogError::BlobNotFound(hash.to_string()));
        }

        let key = reference_key(hash, reference.backend);
        if let Some(bytes) = self.db.get_cf(self.references()?, &key)? {
            let existing: BlobDataStorageReference = decode(&bytes)?;
            if existing.data_reference == reference.reference {
                return Ok(UpsertOutcome::Unchanged);
            }
            return Err(CatalogError::ReferenceConflict {
                hash: hash.to_string(),
                backend: reference.backend,
                existing: existing.data_reference,
                attempted: reference.reference.clone(),
            });
        }

        let row = BlobDataStorageReference::new(hash, reference);
        self.db.put_cf(self.references()?, &key, encode(&row)?)?;
        Ok(UpsertOutcome::Inserted)
    }

    async fn get_reference(&self, hash: &str, backend: BackendId) -> CatalogResult<Option<BlobDataStorageReference>> {
        self.db
            .get_cf(self.references()?, reference_key(hash, backend))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn references_for(&self, hash: &str) -> CatalogResult<Vec<BlobDataStorageReference>> {
        self.read_references(hash)
    }
}

//! # Storage Management Module
//!
//! ## Purpose
//! Durable persistence for catalog entities using an embedded sled database:
//! file records, pending requests and per-namespace ingestion checkpoints.
//!
//! ## Input/Output Specification
//! - **Input**: File records, requests, checkpoints
//! - **Output**: Point lookups by id, full iteration for index rebuilds
//! - **Storage**: One sled tree per entity, bincode-encoded values,
//!   big-endian id keys for ordered iteration
//!
//! ## Key Features
//! - Atomic single-record writes (the only transactional unit the core needs)
//! - Id allocation for requests via sled's monotonic id generator
//! - Sled failures surface as `TransientStorage` so callers can retry

use crate::config::StorageConfig;
use crate::errors::{CatalogError, Result};
use crate::{Checkpoint, FileRecord, RecordId, Request, RequestId};
use std::sync::Arc;

/// Durable store for all persisted catalog entities
pub struct CatalogStore {
    config: StorageConfig,
    db: Arc<sled::Db>,
    records: sled::Tree,
    requests: sled::Tree,
    checkpoints: sled::Tree,
}

fn transient(operation: &str, err: impl std::fmt::Display) -> CatalogError {
    CatalogError::TransientStorage {
        operation: operation.to_string(),
        details: err.to_string(),
    }
}

impl CatalogStore {
    /// Open (or create) the catalog database
    pub async fn open(config: StorageConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = sled::open(&config.db_path)?;
        let records = db.open_tree("file_records")?;
        let requests = db.open_tree("requests")?;
        let checkpoints = db.open_tree("checkpoints")?;

        let store = Self {
            config,
            db: Arc::new(db),
            records,
            requests,
            checkpoints,
        };

        tracing::info!(
            records = store.records.len(),
            requests = store.requests.len(),
            "catalog store opened"
        );
        Ok(store)
    }

    // ---- file records ----

    /// Persist a record, overwriting any prior version under the same id
    pub async fn put_record(&self, record: &FileRecord) -> Result<()> {
        let value = bincode::serialize(record)?;
        self.records
            .insert(record.id.to_be_bytes(), value)
            .map_err(|e| transient("put_record", e))?;
        if self.config.flush_each_commit {
            self.db
                .flush_async()
                .await
                .map_err(|e| transient("flush", e))?;
        }
        Ok(())
    }

    /// Point lookup by record id
    pub async fn get_record(&self, id: RecordId) -> Result<Option<FileRecord>> {
        match self
            .records
            .get(id.to_be_bytes())
            .map_err(|e| transient("get_record", e))?
        {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Remove a record permanently
    pub async fn remove_record(&self, id: RecordId) -> Result<bool> {
        let removed = self
            .records
            .remove(id.to_be_bytes())
            .map_err(|e| transient("remove_record", e))?;
        Ok(removed.is_some())
    }

    /// All persisted records in id order, used for index rebuilds
    pub async fn all_records(&self) -> Result<Vec<FileRecord>> {
        let mut records = Vec::with_capacity(self.records.len());
        for entry in self.records.iter() {
            let (_, value) = entry.map_err(|e| transient("iter_records", e))?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    /// Number of persisted records (live and superseded)
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    // ---- requests ----

    /// Allocate a fresh request id
    pub fn next_request_id(&self) -> Result<RequestId> {
        self.db.generate_id().map_err(|e| transient("generate_id", e))
    }

    /// Persist a request, overwriting any prior version
    pub async fn put_request(&self, request: &Request) -> Result<()> {
        let value = bincode::serialize(request)?;
        self.requests
            .insert(request.id.to_be_bytes(), value)
            .map_err(|e| transient("put_request", e))?;
        Ok(())
    }

    /// Point lookup by request id
    pub async fn get_request(&self, id: RequestId) -> Result<Option<Request>> {
        match self
            .requests
            .get(id.to_be_bytes())
            .map_err(|e| transient("get_request", e))?
        {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All persisted requests in id order
    pub async fn all_requests(&self) -> Result<Vec<Request>> {
        let mut requests = Vec::with_capacity(self.requests.len());
        for entry in self.requests.iter() {
            let (_, value) = entry.map_err(|e| transient("iter_requests", e))?;
            requests.push(bincode::deserialize(&value)?);
        }
        Ok(requests)
    }

    // ---- checkpoints ----

    /// Load the persisted checkpoint for a namespace, if any
    pub async fn load_checkpoint(&self, namespace: &str) -> Result<Option<Checkpoint>> {
        match self
            .checkpoints
            .get(namespace.as_bytes())
            .map_err(|e| transient("load_checkpoint", e))?
        {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Persist a checkpoint for its namespace
    pub async fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let value = bincode::serialize(checkpoint)?;
        self.checkpoints
            .insert(checkpoint.namespace.as_bytes(), value)
            .map_err(|e| transient("store_checkpoint", e))?;
        Ok(())
    }

    /// Drop the checkpoint for a namespace (explicit backfill reset)
    pub async fn reset_checkpoint(&self, namespace: &str) -> Result<()> {
        self.checkpoints
            .remove(namespace.as_bytes())
            .map_err(|e| transient("reset_checkpoint", e))?;
        Ok(())
    }

    // ---- maintenance ----

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| transient("flush", e))?;
        Ok(())
    }

    /// Basic write/read/delete probe against the records tree
    pub async fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.records
            .insert(test_key, b"ok".as_slice())
            .map_err(|e| transient("health_check_write", e))?;
        let read = self
            .records
            .get(test_key)
            .map_err(|e| transient("health_check_read", e))?;
        if read.is_none() {
            return Err(CatalogError::Internal {
                message: "health check value not found after write".to_string(),
            });
        }
        self.records
            .remove(test_key)
            .map_err(|e| transient("health_check_cleanup", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordStatus;
    use chrono::Utc;

    fn test_config(dir: &tempfile::TempDir) -> StorageConfig {
        StorageConfig {
            db_path: dir.path().join("catalog.db"),
            flush_each_commit: false,
        }
    }

    fn record(id: RecordId, title: &str) -> FileRecord {
        FileRecord {
            id,
            raw_caption: title.to_string(),
            file_size: 40_000,
            extension: "srt".to_string(),
            normalized_title: title.to_string(),
            year: Some(1999),
            language_tag: "unknown".to_string(),
            quality_hint: None,
            indexed_at: Utc::now(),
            download_count: 0,
            status: RecordStatus::Live,
        }
    }

    #[tokio::test]
    async fn record_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(test_config(&dir)).await.unwrap();

        store.put_record(&record(7, "the matrix")).await.unwrap();
        let loaded = store.get_record(7).await.unwrap().unwrap();
        assert_eq!(loaded.normalized_title, "the matrix");

        let mut updated = record(7, "the matrix");
        updated.file_size = 99_000;
        store.put_record(&updated).await.unwrap();
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.get_record(7).await.unwrap().unwrap().file_size, 99_000);
    }

    #[tokio::test]
    async fn checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CatalogStore::open(test_config(&dir)).await.unwrap();
            let mut checkpoint = Checkpoint::new("backfill");
            checkpoint.advance(42);
            store.store_checkpoint(&checkpoint).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = CatalogStore::open(test_config(&dir)).await.unwrap();
        let loaded = store.load_checkpoint("backfill").await.unwrap().unwrap();
        assert_eq!(loaded.position, 42);

        store.reset_checkpoint("backfill").await.unwrap();
        assert!(store.load_checkpoint("backfill").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(test_config(&dir)).await.unwrap();
        let a = store.next_request_id().unwrap();
        let b = store.next_request_id().unwrap();
        assert_ne!(a, b);
    }
}

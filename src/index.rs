//! # Index Store Module
//!
//! ## Purpose
//! Holds all file records plus the two derived structures queries run
//! against: an inverted token index and a character n-gram index keyed on
//! normalized titles. Writes go through sled first, then mutate the
//! in-memory derived state under a single write lock so queries never
//! observe a half-applied record.
//!
//! ## Input/Output Specification
//! - **Input**: Record puts, supersedes, deletes; token/n-gram lookups
//! - **Output**: Live records, candidate id sets for the query engine
//! - **Invariant**: Derived indexes reference only live records; removing
//!   or superseding a record removes its entries exactly once
//!
//! ## Key Features
//! - Idempotent `put`: re-putting an id re-derives its index entries
//! - Supersede keeps old ids resolvable for externally held references
//! - Per-id write serialization, no cross-id contention
//! - Self-healing repair pass for dangling derived entries

use crate::errors::{CatalogError, Result};
use crate::normalize::{ngrams, tokenize};
use crate::storage::CatalogStore;
use crate::{FileRecord, RecordId, RecordStatus};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Index store over the persisted catalog
pub struct IndexStore {
    store: Arc<CatalogStore>,
    ngram_size: usize,
    inner: RwLock<IndexInner>,
    id_locks: DashMap<RecordId, Arc<Mutex<()>>>,
}

/// Derived state guarded by one lock so per-record updates are atomic
/// from a reader's point of view
struct IndexInner {
    live: HashMap<RecordId, FileRecord>,
    superseded: HashMap<RecordId, FileRecord>,
    tokens: HashMap<String, HashSet<RecordId>>,
    ngrams: HashMap<String, HashSet<RecordId>>,
}

/// Index statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub live_records: usize,
    pub superseded_records: usize,
    pub distinct_tokens: usize,
    pub distinct_ngrams: usize,
}

impl IndexInner {
    fn add_derived(&mut self, record: &FileRecord, ngram_size: usize) {
        for token in tokenize(&record.normalized_title) {
            self.tokens.entry(token).or_default().insert(record.id);
        }
        for gram in ngrams(&record.normalized_title, ngram_size) {
            self.ngrams.entry(gram).or_default().insert(record.id);
        }
    }

    fn remove_derived(&mut self, record: &FileRecord, ngram_size: usize) {
        for token in tokenize(&record.normalized_title) {
            if let Some(ids) = self.tokens.get_mut(&token) {
                ids.remove(&record.id);
                if ids.is_empty() {
                    self.tokens.remove(&token);
                }
            }
        }
        for gram in ngrams(&record.normalized_title, ngram_size) {
            if let Some(ids) = self.ngrams.get_mut(&gram) {
                ids.remove(&record.id);
                if ids.is_empty() {
                    self.ngrams.remove(&gram);
                }
            }
        }
    }
}

impl IndexStore {
    /// Build the index store by loading all persisted records
    pub async fn open(store: Arc<CatalogStore>, ngram_size: usize) -> Result<Self> {
        let mut inner = IndexInner {
            live: HashMap::new(),
            superseded: HashMap::new(),
            tokens: HashMap::new(),
            ngrams: HashMap::new(),
        };

        for record in store.all_records().await? {
            match record.status {
                RecordStatus::Live => {
                    inner.add_derived(&record, ngram_size);
                    inner.live.insert(record.id, record);
                }
                RecordStatus::SupersededBy(_) => {
                    inner.superseded.insert(record.id, record);
                }
            }
        }

        tracing::info!(
            live = inner.live.len(),
            superseded = inner.superseded.len(),
            "index store loaded"
        );

        Ok(Self {
            store,
            ngram_size,
            inner: RwLock::new(inner),
            id_locks: DashMap::new(),
        })
    }

    fn id_lock(&self, id: RecordId) -> Arc<Mutex<()>> {
        self.id_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Commit a record. Idempotent on id: re-putting overwrites the prior
    /// record and re-derives its index entries.
    pub async fn put(&self, record: FileRecord) -> Result<()> {
        let lock = self.id_lock(record.id);
        let _guard = lock.lock().await;

        self.store.put_record(&record).await?;

        let mut inner = self.inner.write();
        if let Some(previous) = inner.live.remove(&record.id) {
            inner.remove_derived(&previous, self.ngram_size);
        }
        inner.superseded.remove(&record.id);
        inner.add_derived(&record, self.ngram_size);
        inner.live.insert(record.id, record);
        Ok(())
    }

    /// Fetch a record by id regardless of status
    pub fn get(&self, id: RecordId) -> Option<FileRecord> {
        let inner = self.inner.read();
        inner
            .live
            .get(&id)
            .or_else(|| inner.superseded.get(&id))
            .cloned()
    }

    /// Fetch a live record by id
    pub fn get_live(&self, id: RecordId) -> Option<FileRecord> {
        self.inner.read().live.get(&id).cloned()
    }

    /// Follow supersede pointers from any id to the live survivor, so
    /// externally held references keep resolving after deduplication
    pub fn resolve_canonical(&self, id: RecordId) -> Option<FileRecord> {
        let inner = self.inner.read();
        let mut current = id;
        // Bounded walk; supersede chains cannot cycle but a corrupt store
        // should not hang a reader
        for _ in 0..64 {
            if let Some(record) = inner.live.get(&current) {
                return Some(record.clone());
            }
            match inner.superseded.get(&current) {
                Some(record) => match record.status {
                    RecordStatus::SupersededBy(next) => current = next,
                    RecordStatus::Live => return Some(record.clone()),
                },
                None => return None,
            }
        }
        None
    }

    /// Mark `old_id` as superseded by `new_id`, removing it from the
    /// query-visible indexes while keeping its id resolvable
    pub async fn supersede(&self, old_id: RecordId, new_id: RecordId) -> Result<()> {
        self.supersede_group(&[old_id], new_id).await
    }

    /// Supersede every id in the group by the canonical id inside one
    /// exclusive section, so no reader observes a half-superseded group
    pub async fn supersede_group(&self, old_ids: &[RecordId], new_id: RecordId) -> Result<()> {
        if self.get_live(new_id).is_none() {
            return Err(CatalogError::RecordNotFound(new_id));
        }

        // Lock ids in sorted order to avoid deadlock with concurrent writers
        let mut sorted: Vec<RecordId> = old_ids
            .iter()
            .copied()
            .filter(|id| *id != new_id)
            .collect();
        sorted.sort_unstable();
        sorted.dedup();

        let locks: Vec<Arc<Mutex<()>>> = sorted.iter().map(|id| self.id_lock(*id)).collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }

        let mut updated = Vec::with_capacity(sorted.len());
        for old_id in &sorted {
            let mut record = self
                .get_live(*old_id)
                .ok_or(CatalogError::RecordNotFound(*old_id))?;
            record.status = RecordStatus::SupersededBy(new_id);
            self.store.put_record(&record).await?;
            updated.push(record);
        }

        let mut inner = self.inner.write();
        for record in updated {
            if let Some(previous) = inner.live.remove(&record.id) {
                inner.remove_derived(&previous, self.ngram_size);
            }
            inner.superseded.insert(record.id, record);
        }
        Ok(())
    }

    /// Remove a live record and all its derived entries. Irreversible.
    pub async fn delete(&self, id: RecordId) -> Result<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        self.store.remove_record(id).await?;

        let mut inner = self.inner.write();
        if let Some(previous) = inner.live.remove(&id) {
            inner.remove_derived(&previous, self.ngram_size);
        }
        inner.superseded.remove(&id);
        self.id_locks.remove(&id);
        Ok(())
    }

    /// Increment the download counter of the record resolving from `id`
    pub async fn increment_downloads(&self, id: RecordId) -> Result<u64> {
        let canonical = self
            .resolve_canonical(id)
            .ok_or(CatalogError::RecordNotFound(id))?;

        let lock = self.id_lock(canonical.id);
        let _guard = lock.lock().await;

        let mut record = self
            .get_live(canonical.id)
            .ok_or(CatalogError::RecordNotFound(canonical.id))?;
        record.download_count += 1;
        let count = record.download_count;
        self.store.put_record(&record).await?;
        self.inner.write().live.insert(record.id, record);
        Ok(count)
    }

    // ---- read-only lookups for the query engine ----

    /// Live record ids carrying the exact token
    pub fn token_candidates(&self, token: &str) -> Vec<RecordId> {
        self.inner
            .read()
            .tokens
            .get(token)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Live record ids sharing the n-gram
    pub fn ngram_candidates(&self, gram: &str) -> Vec<RecordId> {
        self.inner
            .read()
            .ngrams
            .get(gram)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of all live records, taken under one read lock. Records
    /// ingested after the snapshot are not included.
    pub fn live_snapshot(&self) -> Vec<FileRecord> {
        self.inner.read().live.values().cloned().collect()
    }

    /// Number of live records
    pub fn live_count(&self) -> usize {
        self.inner.read().live.len()
    }

    /// Index statistics
    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read();
        IndexStats {
            live_records: inner.live.len(),
            superseded_records: inner.superseded.len(),
            distinct_tokens: inner.tokens.len(),
            distinct_ngrams: inner.ngrams.len(),
        }
    }

    /// Self-heal pass over the derived structures: drop entries referencing
    /// records that are no longer live, re-derive entries for live records
    /// that lost theirs. Returns the number of repairs applied.
    pub fn repair(&self) -> usize {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let mut repairs = 0;

        let live_ids: HashSet<RecordId> = inner.live.keys().copied().collect();
        for (index_name, map) in [
            ("token", &mut inner.tokens),
            ("ngram", &mut inner.ngrams),
        ] {
            let mut empty_keys = Vec::new();
            for (key, ids) in map.iter_mut() {
                let dangling: Vec<RecordId> = ids
                    .iter()
                    .copied()
                    .filter(|id| !live_ids.contains(id))
                    .collect();
                for id in &dangling {
                    let inconsistency = CatalogError::IndexInconsistency {
                        index: index_name,
                        key: key.clone(),
                        id: *id,
                    };
                    tracing::warn!(error = %inconsistency, "dropping dangling index entry");
                    ids.remove(id);
                }
                repairs += dangling.len();
                if ids.is_empty() {
                    empty_keys.push(key.clone());
                }
            }
            for key in empty_keys {
                map.remove(&key);
            }
        }

        // Re-derive entries for live records missing from either structure
        let records: Vec<FileRecord> = inner.live.values().cloned().collect();
        for record in records {
            let missing_token = tokenize(&record.normalized_title).into_iter().any(|token| {
                inner
                    .tokens
                    .get(&token)
                    .map_or(true, |ids| !ids.contains(&record.id))
            });
            let missing_gram = ngrams(&record.normalized_title, self.ngram_size)
                .into_iter()
                .any(|gram| {
                    inner
                        .ngrams
                        .get(&gram)
                        .map_or(true, |ids| !ids.contains(&record.id))
                });
            if missing_token || missing_gram {
                inner.add_derived(&record, self.ngram_size);
                repairs += 1;
                tracing::warn!(record_id = record.id, "re-derived missing index entries");
            }
        }

        repairs
    }

    /// Flush the backing store
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}

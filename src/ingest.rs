//! # Ingestion Pipeline Module
//!
//! ## Purpose
//! Consumes raw announcements from a source feed (live or historical
//! backfill), normalizes each into a record and commits it to the index
//! store while maintaining a resumable, per-namespace checkpoint.
//!
//! ## Input/Output Specification
//! - **Input**: `(source_position, raw_announcement)` pairs in source order
//! - **Output**: Committed record ids, backfill progress reports
//! - **Workflow**: Guard -> Normalize -> Commit -> Checkpoint -> Reconcile
//!
//! ## Key Features
//! - Duplicate-delivery guard against the persisted checkpoint
//! - Idempotent commit: retrying a position re-puts the same record id
//! - Bounded exponential backoff for transient storage failures
//! - Cooperative cancellation; interrupted backfills resume cleanly
//! - Reconciliation failures are logged, never block ingestion

use crate::config::IngestionConfig;
use crate::errors::{CatalogError, Result};
use crate::index::IndexStore;
use crate::normalize::{Normalizer, RawAnnouncement};
use crate::requests::RequestReconciler;
use crate::storage::CatalogStore;
use crate::{Checkpoint, RecordId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Cooperative stop signal for long-running backfills and scans.
/// Processing halts after the current record completes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Source of announcements, live feed or historical range.
///
/// Implementations must deliver monotonically increasing positions within
/// one session; redelivery after a restart is tolerated by the pipeline.
#[async_trait]
pub trait AnnouncementSource: Send {
    /// Source identifier for logs and reports
    fn name(&self) -> &str;

    /// Fetch up to `limit` announcements with positions strictly greater
    /// than `after`, oldest first. An empty batch means the source is
    /// exhausted.
    async fn fetch_after(
        &mut self,
        after: RecordId,
        limit: usize,
    ) -> Result<Vec<(RecordId, RawAnnouncement)>>;
}

/// Terminal state of a backfill run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackfillStatus {
    Completed,
    Cancelled,
    Failed,
}

/// Progress summary returned to admin callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillReport {
    pub namespace: String,
    pub status: BackfillStatus,
    pub processed: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub final_position: RecordId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Ingestion pipeline bound to one checkpoint namespace
pub struct IngestionPipeline {
    config: IngestionConfig,
    normalizer: Arc<Normalizer>,
    index: Arc<IndexStore>,
    store: Arc<CatalogStore>,
    reconciler: Arc<RequestReconciler>,
    namespace: String,
    // Serializes ingestion within the namespace and guards checkpoint
    // monotonicity
    checkpoint: Mutex<Checkpoint>,
}

impl IngestionPipeline {
    /// Open a pipeline for a checkpoint namespace, resuming from the last
    /// persisted position
    pub async fn open(
        config: IngestionConfig,
        normalizer: Arc<Normalizer>,
        index: Arc<IndexStore>,
        store: Arc<CatalogStore>,
        reconciler: Arc<RequestReconciler>,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let checkpoint = store
            .load_checkpoint(&namespace)
            .await?
            .unwrap_or_else(|| Checkpoint::new(namespace.clone()));

        tracing::info!(
            namespace = %namespace,
            position = checkpoint.position,
            "ingestion pipeline opened"
        );

        Ok(Self {
            config,
            normalizer,
            index,
            store,
            reconciler,
            namespace,
            checkpoint: Mutex::new(checkpoint),
        })
    }

    /// Last committed source position for this namespace
    pub async fn position(&self) -> RecordId {
        self.checkpoint.lock().await.position
    }

    /// Ingest one announcement at a source position.
    ///
    /// Never commits a position at or behind the persisted checkpoint;
    /// redelivered positions come back as `CheckpointConflict`. The
    /// checkpoint only advances once the record commit succeeded, so a
    /// failed attempt can be retried with the same id and overwrite
    /// rather than duplicate.
    pub async fn ingest(&self, position: RecordId, raw: &RawAnnouncement) -> Result<RecordId> {
        let mut checkpoint = self.checkpoint.lock().await;

        if position <= checkpoint.position {
            return Err(CatalogError::CheckpointConflict {
                namespace: self.namespace.clone(),
                position,
                checkpoint: checkpoint.position,
            });
        }

        let draft = self.normalizer.normalize(raw)?;
        let record = draft.into_record(position, raw, Utc::now());
        let title = record.normalized_title.clone();

        self.with_retry("index_put", || self.index.put(record.clone()))
            .await?;

        checkpoint.advance(position);
        let snapshot = checkpoint.clone();
        self.with_retry("store_checkpoint", || self.store.store_checkpoint(&snapshot))
            .await?;

        tracing::debug!(
            namespace = %self.namespace,
            position,
            title = %title,
            "record committed"
        );

        // Reconciliation must not block ingestion of subsequent records
        if let Some(committed) = self.index.get_live(position) {
            if let Err(e) = self.reconciler.reconcile(&committed).await {
                tracing::warn!(
                    position,
                    error = %e,
                    category = e.category(),
                    "request reconciliation failed"
                );
            }
        }

        Ok(position)
    }

    /// Replay announcements oldest-to-newest from the persisted checkpoint.
    /// May be interrupted via `cancel` and resumed later without
    /// reprocessing committed positions.
    pub async fn run_backfill<S: AnnouncementSource>(
        &self,
        source: &mut S,
        limit: Option<usize>,
        cancel: &CancelFlag,
    ) -> Result<BackfillReport> {
        let started_at = Utc::now();
        let mut report = BackfillReport {
            namespace: self.namespace.clone(),
            status: BackfillStatus::Completed,
            processed: 0,
            indexed: 0,
            skipped: 0,
            duplicates: 0,
            errors: 0,
            final_position: self.position().await,
            started_at,
            finished_at: started_at,
            error_message: None,
        };

        tracing::info!(
            namespace = %self.namespace,
            source = source.name(),
            from = report.final_position,
            "starting backfill"
        );

        'outer: loop {
            if cancel.is_cancelled() {
                report.status = BackfillStatus::Cancelled;
                break;
            }
            if let Some(max) = limit {
                if report.processed >= max {
                    break;
                }
            }

            let after = self.position().await;
            let batch = source
                .fetch_after(after, self.config.backfill_batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            for (position, raw) in batch {
                if cancel.is_cancelled() {
                    report.status = BackfillStatus::Cancelled;
                    break 'outer;
                }
                if let Some(max) = limit {
                    if report.processed >= max {
                        break 'outer;
                    }
                }
                report.processed += 1;

                match self.ingest(position, &raw).await {
                    Ok(_) => report.indexed += 1,
                    Err(CatalogError::Validation { field, reason }) => {
                        // Unindexable announcement: skip and advance past it
                        report.skipped += 1;
                        tracing::debug!(position, field = %field, reason = %reason, "announcement skipped");
                        self.advance_past(position).await?;
                    }
                    Err(CatalogError::CheckpointConflict { .. }) => {
                        report.duplicates += 1;
                    }
                    Err(e) => {
                        report.errors += 1;
                        report.status = BackfillStatus::Failed;
                        report.error_message = Some(e.to_string());
                        tracing::error!(position, error = %e, "backfill aborted");
                        break 'outer;
                    }
                }

                if report.processed % 100 == 0 {
                    tracing::info!(
                        namespace = %self.namespace,
                        processed = report.processed,
                        indexed = report.indexed,
                        "backfill progress"
                    );
                }
            }

            if self.config.rate_limit_delay_ms > 0 {
                sleep(Duration::from_millis(self.config.rate_limit_delay_ms)).await;
            }
        }

        report.final_position = self.position().await;
        report.finished_at = Utc::now();
        tracing::info!(
            namespace = %self.namespace,
            status = ?report.status,
            processed = report.processed,
            indexed = report.indexed,
            skipped = report.skipped,
            duplicates = report.duplicates,
            "backfill finished"
        );
        Ok(report)
    }

    /// Advance the checkpoint past a skipped position
    async fn advance_past(&self, position: RecordId) -> Result<()> {
        let mut checkpoint = self.checkpoint.lock().await;
        if checkpoint.advance(position) {
            let snapshot = checkpoint.clone();
            self.with_retry("store_checkpoint", || self.store.store_checkpoint(&snapshot))
                .await?;
        }
        Ok(())
    }

    /// Retry a storage operation with bounded exponential backoff
    async fn with_retry<F, Fut>(&self, operation: &str, mut call: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() && attempt + 1 < self.config.retry_attempts => {
                    attempt += 1;
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient storage failure, retrying"
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

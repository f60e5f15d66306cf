//! # Catalog Facade Module
//!
//! ## Purpose
//! Wires the normalizer, storage, index, query engine, scanner and request
//! reconciler into one handle for admin callers and the CLI. All operations
//! a caller needs go through this facade.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration, raw announcements, queries, requests
//! - **Output**: Search pages, reports, fulfillment event streams
//! - **Startup**: Rebuilds the in-memory index from storage and runs a
//!   self-heal pass before serving

use crate::config::Config;
use crate::dedupe::{DuplicateScanner, ScanReport};
use crate::errors::{CatalogError, Result};
use crate::index::{IndexStats, IndexStore};
use crate::ingest::{AnnouncementSource, BackfillReport, CancelFlag, IngestionPipeline};
use crate::normalize::{Normalizer, RawAnnouncement};
use crate::requests::{FulfillmentEvent, RequestReconciler};
use crate::search::{SearchEngine, SearchPage};
use crate::storage::CatalogStore;
use crate::{FileRecord, RecordId, Request, RequestId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Checkpoint namespace of the live announcement feed
const LIVE_NAMESPACE: &str = "live";
/// Checkpoint namespace of historical backfill runs
const BACKFILL_NAMESPACE: &str = "backfill";

/// Aggregate catalog statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogStats {
    pub index: IndexStats,
    pub pending_requests: usize,
    pub persisted_records: usize,
}

/// One handle over the whole subtitle catalog engine
pub struct Catalog {
    config: Config,
    store: Arc<CatalogStore>,
    normalizer: Arc<Normalizer>,
    index: Arc<IndexStore>,
    engine: SearchEngine,
    scanner: DuplicateScanner,
    reconciler: Arc<RequestReconciler>,
    live_pipeline: IngestionPipeline,
}

impl Catalog {
    /// Open the catalog: load storage, rebuild the index, self-heal, and
    /// wire every component
    pub async fn open(config: Config) -> Result<Self> {
        let store = Arc::new(CatalogStore::open(config.storage.clone()).await?);
        let normalizer = Arc::new(Normalizer::new(&config.normalizer)?);
        let index = Arc::new(IndexStore::open(store.clone(), config.search.ngram_size).await?);

        let repairs = index.repair();
        if repairs > 0 {
            tracing::warn!(repairs, "index self-heal applied repairs on startup");
        }

        let engine = SearchEngine::new(config.search.clone(), index.clone(), normalizer.clone());
        let scanner = DuplicateScanner::new(config.scanner.clone(), index.clone());
        let reconciler = Arc::new(RequestReconciler::open(store.clone()).await?);
        let live_pipeline = IngestionPipeline::open(
            config.ingestion.clone(),
            normalizer.clone(),
            index.clone(),
            store.clone(),
            reconciler.clone(),
            LIVE_NAMESPACE,
        )
        .await?;

        tracing::info!(live_records = index.live_count(), "catalog opened");

        Ok(Self {
            config,
            store,
            normalizer,
            index,
            engine,
            scanner,
            reconciler,
            live_pipeline,
        })
    }

    // ---- ingestion ----

    /// Ingest one live announcement at its source position
    pub async fn ingest(&self, position: RecordId, raw: &RawAnnouncement) -> Result<RecordId> {
        self.live_pipeline.ingest(position, raw).await
    }

    /// Replay a historical source from the persisted backfill checkpoint
    pub async fn run_backfill<S: AnnouncementSource>(
        &self,
        source: &mut S,
        limit: Option<usize>,
        cancel: &CancelFlag,
    ) -> Result<BackfillReport> {
        let pipeline = IngestionPipeline::open(
            self.config.ingestion.clone(),
            self.normalizer.clone(),
            self.index.clone(),
            self.store.clone(),
            self.reconciler.clone(),
            BACKFILL_NAMESPACE,
        )
        .await?;
        pipeline.run_backfill(source, limit, cancel).await
    }

    /// Drop the backfill checkpoint so the next run starts from scratch
    pub async fn reset_backfill(&self) -> Result<()> {
        self.store.reset_checkpoint(BACKFILL_NAMESPACE).await
    }

    // ---- queries ----

    /// Run a query; `page` is 1-based and `page_size` of zero selects the
    /// configured default
    pub async fn search(&self, query: &str, page: usize, page_size: usize) -> Result<SearchPage> {
        self.engine.search(query, page, page_size)
    }

    /// Resolve any id (live or superseded) to its live record
    pub fn get_record(&self, id: RecordId) -> Option<FileRecord> {
        self.index.resolve_canonical(id)
    }

    /// Live records with the highest download counters
    pub fn most_downloaded(&self, limit: usize) -> Vec<FileRecord> {
        let mut records = self.index.live_snapshot();
        records.sort_by(|a, b| {
            b.download_count
                .cmp(&a.download_count)
                .then_with(|| a.id.cmp(&b.id))
        });
        records.truncate(limit);
        records
    }

    /// Record one completed download against any id; the counter lands on
    /// the live record the id resolves to
    pub async fn record_downloaded(&self, id: RecordId) -> Result<u64> {
        self.index.increment_downloads(id).await
    }

    /// Serialize all live records to JSON, sorted by id
    pub fn export_catalog(&self) -> Result<String> {
        let mut records = self.index.live_snapshot();
        records.sort_by_key(|record| record.id);
        Ok(serde_json::to_string_pretty(&records)?)
    }

    // ---- requests ----

    /// File a request for a title; the query text goes through the same
    /// normalization as record titles
    pub async fn create_request(
        &self,
        title: &str,
        year: Option<i32>,
        requested_by: i64,
    ) -> Result<Request> {
        let normalized = self.normalizer.normalize_title(title);
        if normalized.is_empty() {
            return Err(CatalogError::Validation {
                field: "title".to_string(),
                reason: format!("request title is empty after normalization: '{}'", title),
            });
        }
        self.reconciler
            .create_request(normalized, year, requested_by)
            .await
    }

    /// Look up a request by id
    pub async fn get_request(&self, id: RequestId) -> Result<Option<Request>> {
        self.reconciler.get(id).await
    }

    /// Expire pending requests past the configured retention window
    pub async fn expire_requests(&self) -> Result<Vec<RequestId>> {
        self.reconciler
            .expire_stale(self.config.requests.retention_days)
            .await
    }

    /// Stream of fulfillment events for the notification collaborator
    pub fn subscribe_fulfillments(&self) -> mpsc::UnboundedReceiver<FulfillmentEvent> {
        self.reconciler.subscribe()
    }

    // ---- maintenance ----

    /// Scan for duplicates and supersede every loser
    pub async fn run_scan(&self) -> Result<ScanReport> {
        self.scanner.run().await
    }

    /// Aggregate statistics for admin callers
    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            index: self.index.stats(),
            pending_requests: self.reconciler.pending_count(),
            persisted_records: self.store.record_count(),
        }
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    /// Probe storage health
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("catalog.db");
        config.ingestion.rate_limit_delay_ms = 0;
        config
    }

    fn announcement(file_name: &str) -> RawAnnouncement {
        RawAnnouncement {
            caption: None,
            file_name: file_name.to_string(),
            file_size: 45_000,
        }
    }

    struct VecSource(Vec<(RecordId, RawAnnouncement)>);

    #[async_trait]
    impl AnnouncementSource for VecSource {
        fn name(&self) -> &str {
            "vec"
        }

        async fn fetch_after(
            &mut self,
            after: RecordId,
            limit: usize,
        ) -> Result<Vec<(RecordId, RawAnnouncement)>> {
            Ok(self
                .0
                .iter()
                .filter(|(pos, _)| *pos > after)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn ingest_search_and_download_flow() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(test_config(&dir)).await.unwrap();

        catalog
            .ingest(1, &announcement("The Matrix (1999) 1080p.srt"))
            .await
            .unwrap();

        let page = catalog.search("matrix", 1, 10).await.unwrap();
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].record.year, Some(1999));

        let count = catalog.record_downloaded(1).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(catalog.most_downloaded(5)[0].id, 1);
    }

    #[tokio::test]
    async fn request_is_fulfilled_by_matching_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(test_config(&dir)).await.unwrap();
        let mut events = catalog.subscribe_fulfillments();

        let request = catalog
            .create_request("The Matrix", Some(1999), 42)
            .await
            .unwrap();
        assert_eq!(request.normalized_title, "the matrix");

        catalog
            .ingest(1, &announcement("The.Matrix.1999.srt"))
            .await
            .unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.request_id, request.id);
        assert_eq!(event.record_id, 1);

        let settled = catalog.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(settled.status, crate::RequestStatus::Fulfilled);
    }

    #[tokio::test]
    async fn backfill_scan_and_export_work_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(test_config(&dir)).await.unwrap();

        let mut source = VecSource(vec![
            (1, announcement("Dune.2021.srt")),
            (2, announcement("Dune 2021.srt")),
            (3, announcement("Arrival.2016.srt")),
        ]);
        let report = catalog
            .run_backfill(&mut source, None, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.indexed, 3);

        // The two Dune records normalize identically and collapse
        let scan = catalog.run_scan().await.unwrap();
        assert_eq!(scan.records_superseded, 1);
        assert_eq!(catalog.stats().index.live_records, 2);

        let export = catalog.export_catalog().unwrap();
        let parsed: Vec<FileRecord> = serde_json::from_str(&export).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn catalog_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let catalog = Catalog::open(test_config(&dir)).await.unwrap();
            catalog
                .ingest(7, &announcement("Blade Runner 1982.srt"))
                .await
                .unwrap();
            catalog.flush().await.unwrap();
        }

        let catalog = Catalog::open(test_config(&dir)).await.unwrap();
        let page = catalog.search("blade runner", 1, 10).await.unwrap();
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].record.id, 7);
    }
}

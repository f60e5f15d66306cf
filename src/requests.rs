//! # Request Reconciliation Module
//!
//! ## Purpose
//! Tracks outstanding user requests for titles and reconciles them against
//! newly ingested records. A matched request transitions to fulfilled
//! exactly once and emits one fulfillment event for the notification
//! collaborator.
//!
//! ## Input/Output Specification
//! - **Input**: New requests, newly committed records
//! - **Output**: Fulfilled request ids, fulfillment events
//! - **Guarantee**: A request is never matched twice, even when several
//!   matching records arrive in sequence

use crate::errors::Result;
use crate::storage::CatalogStore;
use crate::{FileRecord, RecordId, Request, RequestId, RequestStatus};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Emitted once per fulfilled request; consumed by the notification
/// collaborator outside this crate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentEvent {
    pub request_id: RequestId,
    pub record_id: RecordId,
    pub requested_by: i64,
    pub normalized_title: String,
}

/// Reconciles pending requests against newly ingested records
pub struct RequestReconciler {
    store: Arc<CatalogStore>,
    pending: RwLock<HashMap<RequestId, Request>>,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<FulfillmentEvent>>>,
}

impl RequestReconciler {
    /// Load pending requests from the store
    pub async fn open(store: Arc<CatalogStore>) -> Result<Self> {
        let mut pending = HashMap::new();
        for request in store.all_requests().await? {
            if request.status == RequestStatus::Pending {
                pending.insert(request.id, request);
            }
        }
        tracing::info!(pending = pending.len(), "request reconciler loaded");
        Ok(Self {
            store,
            pending: RwLock::new(pending),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    /// Register a fulfillment event consumer
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FulfillmentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Record a new pending request. The title must already be normalized
    /// with the same rules applied to record titles.
    pub async fn create_request(
        &self,
        normalized_title: String,
        year: Option<i32>,
        requested_by: i64,
    ) -> Result<Request> {
        let request = Request {
            id: self.store.next_request_id()?,
            normalized_title,
            year,
            requested_by,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            fulfilled_at: None,
            fulfilled_by: None,
        };
        self.store.put_request(&request).await?;
        self.pending.write().insert(request.id, request.clone());
        tracing::debug!(
            request_id = request.id,
            title = %request.normalized_title,
            "request created"
        );
        Ok(request)
    }

    /// Match a newly committed record against all pending requests.
    /// Returns the ids fulfilled by this record; an empty result is the
    /// normal no-match outcome, not an error.
    pub async fn reconcile(&self, record: &FileRecord) -> Result<Vec<RequestId>> {
        if !record.is_live() {
            return Ok(Vec::new());
        }

        // Claim matches under the write lock so a request can only be
        // fulfilled by one record
        let matched: Vec<Request> = {
            let mut pending = self.pending.write();
            let ids: Vec<RequestId> = pending
                .values()
                .filter(|request| {
                    request.normalized_title == record.normalized_title
                        && match (request.year, record.year) {
                            (Some(wanted), Some(got)) => wanted == got,
                            (Some(_), None) => false,
                            (None, _) => true,
                        }
                })
                .map(|request| request.id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };

        let mut fulfilled = Vec::with_capacity(matched.len());
        for mut request in matched {
            request.status = RequestStatus::Fulfilled;
            request.fulfilled_at = Some(Utc::now());
            request.fulfilled_by = Some(record.id);
            self.store.put_request(&request).await?;

            self.emit(FulfillmentEvent {
                request_id: request.id,
                record_id: record.id,
                requested_by: request.requested_by,
                normalized_title: request.normalized_title.clone(),
            });
            tracing::info!(
                request_id = request.id,
                record_id = record.id,
                title = %request.normalized_title,
                "request fulfilled"
            );
            fulfilled.push(request.id);
        }
        Ok(fulfilled)
    }

    /// Expire pending requests older than the retention window
    pub async fn expire_stale(&self, retention_days: i64) -> Result<Vec<RequestId>> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let stale: Vec<Request> = {
            let mut pending = self.pending.write();
            let ids: Vec<RequestId> = pending
                .values()
                .filter(|request| request.created_at < cutoff)
                .map(|request| request.id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };

        let mut expired = Vec::with_capacity(stale.len());
        for mut request in stale {
            request.status = RequestStatus::Expired;
            self.store.put_request(&request).await?;
            expired.push(request.id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired stale requests");
        }
        Ok(expired)
    }

    /// Look up a request by id, pending or settled
    pub async fn get(&self, id: RequestId) -> Result<Option<Request>> {
        if let Some(request) = self.pending.read().get(&id) {
            return Ok(Some(request.clone()));
        }
        self.store.get_request(id).await
    }

    /// Number of currently pending requests
    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    fn emit(&self, event: FulfillmentEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::RecordStatus;

    async fn reconciler(dir: &tempfile::TempDir) -> RequestReconciler {
        let store = Arc::new(
            CatalogStore::open(StorageConfig {
                db_path: dir.path().join("catalog.db"),
                flush_each_commit: false,
            })
            .await
            .unwrap(),
        );
        RequestReconciler::open(store).await.unwrap()
    }

    fn record(id: RecordId, title: &str, year: Option<i32>) -> FileRecord {
        FileRecord {
            id,
            raw_caption: title.to_string(),
            file_size: 1_000,
            extension: "srt".to_string(),
            normalized_title: title.to_string(),
            year,
            language_tag: "unknown".to_string(),
            quality_hint: None,
            indexed_at: Utc::now(),
            download_count: 0,
            status: RecordStatus::Live,
        }
    }

    #[tokio::test]
    async fn fulfills_exactly_once_across_repeated_matches() {
        let dir = tempfile::tempdir().unwrap();
        let recon = reconciler(&dir).await;
        let mut events = recon.subscribe();

        let request = recon
            .create_request("the matrix".to_string(), Some(1999), 42)
            .await
            .unwrap();

        let first = recon.reconcile(&record(1, "the matrix", Some(1999))).await.unwrap();
        assert_eq!(first, vec![request.id]);

        // A second matching record must not fulfill the same request again
        let second = recon.reconcile(&record(2, "the matrix", Some(1999))).await.unwrap();
        assert!(second.is_empty());

        let event = events.try_recv().unwrap();
        assert_eq!(event.request_id, request.id);
        assert_eq!(event.record_id, 1);
        assert!(events.try_recv().is_err());

        let settled = recon.get(request.id).await.unwrap().unwrap();
        assert_eq!(settled.status, RequestStatus::Fulfilled);
        assert_eq!(settled.fulfilled_by, Some(1));
    }

    #[tokio::test]
    async fn year_constraint_must_match_when_specified() {
        let dir = tempfile::tempdir().unwrap();
        let recon = reconciler(&dir).await;

        recon
            .create_request("dune".to_string(), Some(2021), 7)
            .await
            .unwrap();

        assert!(recon
            .reconcile(&record(1, "dune", Some(1984)))
            .await
            .unwrap()
            .is_empty());
        assert!(recon
            .reconcile(&record(2, "dune", None))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            recon
                .reconcile(&record(3, "dune", Some(2021)))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn request_without_year_matches_any_year() {
        let dir = tempfile::tempdir().unwrap();
        let recon = reconciler(&dir).await;

        recon
            .create_request("oldboy".to_string(), None, 7)
            .await
            .unwrap();
        assert_eq!(
            recon
                .reconcile(&record(1, "oldboy", Some(2003)))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn no_match_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let recon = reconciler(&dir).await;
        let fulfilled = recon
            .reconcile(&record(1, "tenet", Some(2020)))
            .await
            .unwrap();
        assert!(fulfilled.is_empty());
    }

    #[tokio::test]
    async fn stale_requests_expire() {
        let dir = tempfile::tempdir().unwrap();
        let recon = reconciler(&dir).await;

        let request = recon
            .create_request("seven samurai".to_string(), None, 9)
            .await
            .unwrap();
        // Retention of zero days expires everything created before now
        let expired = recon.expire_stale(0).await.unwrap();
        assert_eq!(expired, vec![request.id]);
        assert_eq!(recon.pending_count(), 0);

        let settled = recon.get(request.id).await.unwrap().unwrap();
        assert_eq!(settled.status, RequestStatus::Expired);
    }
}

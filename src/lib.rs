//! # Subtitle Catalog Engine
//!
//! ## Overview
//! This library catalogs subtitle files announced in a source channel, makes
//! them discoverable via typo-tolerant search, and keeps the catalog free of
//! duplicates while reconciling outstanding user requests against newly
//! arriving files.
//!
//! ## Architecture
//! The system is composed of several key modules:
//! - `normalize`: Turns raw file announcements into canonical records
//! - `storage`: Durable sled-backed store for records, requests, checkpoints
//! - `index`: Index store with inverted token and trigram indexes
//! - `ingest`: Resumable ingestion pipeline with checkpointing
//! - `search`: Fuzzy query engine with scoring, ranking and pagination
//! - `dedupe`: Duplicate scanner with supersede-based resolution
//! - `requests`: Reconciliation of pending requests against new records
//! - `catalog`: Facade wiring the components together for admin callers
//! - `config`: Configuration management and tunable thresholds
//! - `errors`: Centralized error handling and types
//!
//! ## Input/Output Specification
//! - **Input**: Raw announcements (caption, filename, size), search queries
//! - **Output**: Ranked search results, fulfillment events, scan reports
//! - **Guarantees**: Idempotent re-ingestion, deterministic normalization,
//!   resumable backfill, no false-positive duplicate deletions
//!
//! ## Usage
//! ```rust,no_run
//! use subtitle_catalog::{Catalog, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.toml")?;
//!     let catalog = Catalog::open(config).await?;
//!     let page = catalog.search("the matrix", 1, 10).await?;
//!     println!("Found {} results", page.hits.len());
//!     Ok(())
//! }
//! ```

// Core modules
pub mod catalog;
pub mod config;
pub mod dedupe;
pub mod errors;
pub mod index;
pub mod ingest;
pub mod normalize;
pub mod requests;
pub mod search;
pub mod storage;

// Re-exports for convenience
pub use catalog::Catalog;
pub use config::Config;
pub use errors::{CatalogError, Result};
pub use search::{SearchHit, SearchPage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier for a file record, taken from the source channel
/// message id. Never reused.
pub type RecordId = i64;

/// Identifier for a user request
pub type RequestId = u64;

/// Lifecycle state of a file record. A record is either live or points at
/// the record that superseded it, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Visible to queries and reconciliation
    Live,
    /// Replaced by another record; id remains resolvable
    SupersededBy(RecordId),
}

/// Canonical catalog entry derived from one announcement.
///
/// Immutable once created; mutated only through explicit supersede/delete
/// on the index store, or the external download counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Source message id (primary key)
    pub id: RecordId,
    /// Original caption or filename the record was derived from
    pub raw_caption: String,
    /// File size in bytes
    pub file_size: u64,
    /// Subtitle extension (lowercased, no dot)
    pub extension: String,
    /// Lowercased, punctuation-stripped, diacritics-folded title
    pub normalized_title: String,
    /// Release year, when present in the announcement
    pub year: Option<i32>,
    /// Language tag from explicit caption markers, or "unknown"
    pub language_tag: String,
    /// Quality/resolution hint (1080p, BluRay, x265, ...)
    pub quality_hint: Option<String>,
    /// When the record was committed to the index
    pub indexed_at: DateTime<Utc>,
    /// Monotonic counter, incremented externally on fulfillment
    pub download_count: u64,
    /// Live or superseded
    pub status: RecordStatus,
}

impl FileRecord {
    /// Whether the record is visible to queries and reconciliation
    pub fn is_live(&self) -> bool {
        self.status == RecordStatus::Live
    }
}

/// Durable marker of ingestion progress for one source run.
///
/// Monotonically non-decreasing within a run; a new backfill run resumes
/// from the last persisted position unless explicitly reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Namespace separating concurrent source runs (live feed vs backfill)
    pub namespace: String,
    /// Last successfully committed source position
    pub position: RecordId,
    /// Last persistence time
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh checkpoint at the start of a namespace
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            position: 0,
            updated_at: Utc::now(),
        }
    }

    /// Advance to a later position. Positions at or behind the current one
    /// are rejected to keep the checkpoint monotonic.
    pub fn advance(&mut self, position: RecordId) -> bool {
        if position > self.position {
            self.position = position;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }
}

/// Status of a user request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Fulfilled,
    Expired,
}

/// A user's pending ask for a title
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// Normalized with the same rules as record titles
    pub normalized_title: String,
    /// Optional year constraint
    pub year: Option<i32>,
    /// Requesting user id
    pub requested_by: i64,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    /// Record that fulfilled the request, once matched
    pub fulfilled_by: Option<RecordId>,
}

/// Transient output of the duplicate scanner: records judged equivalent
/// plus the chosen canonical survivor. Consumed immediately by `apply`,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// All member ids, canonical included
    pub ids: Vec<RecordId>,
    /// Deterministically chosen survivor
    pub canonical: RecordId,
}

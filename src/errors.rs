//! # Error Handling Module
//!
//! ## Purpose
//! Centralized error handling for the subtitle catalog engine, covering the
//! full taxonomy the core components rely on: validation rejections during
//! normalization, transient storage failures, checkpoint conflicts during
//! backfill, and derived-index inconsistencies.
//!
//! ## Input/Output Specification
//! - **Input**: Error conditions from normalizer, index store, pipeline, scanner
//! - **Output**: Structured error types with context for callers and logs
//! - **Error Categories**: validation, storage, checkpoint, index, config
//!
//! ## Key Features
//! - `is_recoverable()` distinguishes retry-with-backoff errors from fatal ones
//! - `category()` groups errors for structured logging
//! - Automatic conversion from sled/bincode/serde/toml errors

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Error types for the subtitle catalog engine
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Announcement could not be normalized into an indexable record.
    /// The caller skips the announcement and advances its position.
    #[error("validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Lookup or write failure against persistence that is expected to
    /// succeed on retry. The checkpoint is not advanced past it.
    #[error("transient storage failure during {operation}: {details}")]
    TransientStorage { operation: String, details: String },

    /// Observed source position is at or behind the persisted checkpoint.
    /// Treated as already-processed and skipped silently by the pipeline.
    #[error("position {position} not ahead of checkpoint {checkpoint} in namespace '{namespace}'")]
    CheckpointConflict {
        namespace: String,
        position: i64,
        checkpoint: i64,
    },

    /// A derived index entry references a record that no longer resolves.
    /// The index store self-heals by rebuilding or dropping the entry.
    #[error("{index} index entry '{key}' references missing record {id}")]
    IndexInconsistency {
        index: &'static str,
        key: String,
        id: i64,
    },

    #[error("record {0} not found")]
    RecordNotFound(i64),

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Database errors
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    /// Binary serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON errors (export, replay source)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violations
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CatalogError {
    /// Check if the error is recoverable (worth retrying with backoff)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CatalogError::TransientStorage { .. } | CatalogError::Io(_)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            CatalogError::Validation { .. } => "validation",
            CatalogError::TransientStorage { .. }
            | CatalogError::Database(_)
            | CatalogError::Serialization(_)
            | CatalogError::Io(_) => "storage",
            CatalogError::CheckpointConflict { .. } => "checkpoint",
            CatalogError::IndexInconsistency { .. } | CatalogError::RecordNotFound(_) => "index",
            CatalogError::Config { .. } | CatalogError::Toml(_) => "configuration",
            CatalogError::Json(_) => "serialization",
            CatalogError::Internal { .. } => "generic",
        }
    }
}

//! # Configuration Management Module
//!
//! ## Purpose
//! Centralized configuration for the subtitle catalog engine. All fuzzy
//! matching and duplicate grouping tolerances live here as explicit,
//! documented settings so tuning never touches core logic.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration files (TOML), environment variables
//! - **Output**: Validated configuration structs with defaults and overrides
//! - **Validation**: Range checks on thresholds, page sizes, retry settings
//!
//! ## Configuration Sources (in order of precedence)
//! 1. Environment variables (`SUBCAT_*`)
//! 2. Configuration file
//! 3. Default values
//!
//! ## Usage
//! ```rust,no_run
//! use subtitle_catalog::config::Config;
//!
//! let config = Config::from_file("config.toml")?;
//! println!("Database path: {:?}", config.storage.db_path);
//! # Ok::<(), subtitle_catalog::CatalogError>(())
//! ```

use crate::errors::{CatalogError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure containing all system settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage and database settings
    pub storage: StorageConfig,
    /// Metadata normalizer settings
    pub normalizer: NormalizerConfig,
    /// Ingestion pipeline settings
    pub ingestion: IngestionConfig,
    /// Fuzzy query engine behavior
    pub search: SearchConfig,
    /// Duplicate scanner tolerances
    pub scanner: ScannerConfig,
    /// Request retention policy
    pub requests: RequestsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Storage and database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database directory path
    pub db_path: PathBuf,
    /// Flush sled to disk after every committed record
    pub flush_each_commit: bool,
}

/// Metadata normalizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Subtitle extensions accepted into the catalog (lowercase, no dot)
    pub allowed_extensions: Vec<String>,
    /// Regex patterns stripped from captions before title extraction
    pub noise_patterns: Vec<String>,
    /// Lowest plausible release year
    pub min_year: i32,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Retry attempts for transient storage failures
    pub retry_attempts: u32,
    /// Initial retry delay; doubles per attempt
    pub retry_delay_ms: u64,
    /// Announcements fetched per backfill batch
    pub backfill_batch_size: usize,
    /// Delay between backfill batches to respect source rate limits
    pub rate_limit_delay_ms: u64,
}

/// Fuzzy query engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Character n-gram size for the fuzzy index
    pub ngram_size: usize,
    /// Minimum n-gram overlap ratio for a fuzzy candidate
    pub min_ngram_overlap: f32,
    /// Allow one edit per this many query characters
    pub edit_distance_per_chars: usize,
    /// Edit tolerance floor regardless of query length
    pub min_edit_tolerance: usize,
    /// Score weight per exactly matched token
    pub exact_token_weight: f32,
    /// Score weight for inverse edit distance
    pub fuzzy_weight: f32,
    /// Score weight for recency
    pub recency_weight: f32,
    /// Recency contribution halves every this many days
    pub recency_half_life_days: f32,
    /// Default page size when the caller passes zero
    pub default_page_size: usize,
    /// Upper bound on page size
    pub max_page_size: usize,
    /// Minimum query length in characters
    pub min_query_length: usize,
    /// Maximum query length in characters
    pub max_query_length: usize,
}

/// Duplicate scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Maximum file-size divergence (percent of the larger file) for two
    /// records with matching title/year/extension to be grouped
    pub size_tolerance_percent: f32,
}

/// Request retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestsConfig {
    /// Pending requests older than this expire
    pub retention_days: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }

    /// Load configuration from a specific file, falling back to defaults
    /// when the file does not exist
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| CatalogError::Config {
                message: format!("failed to read config file {:?}: {}", path, e),
            })?;
            toml::from_str(&content).map_err(|e| CatalogError::Config {
                message: format!("failed to parse config file {:?}: {}", path, e),
            })?
        } else {
            tracing::warn!("configuration file not found: {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(db_path) = std::env::var("SUBCAT_DB_PATH") {
            self.storage.db_path = PathBuf::from(db_path);
        }
        if let Ok(level) = std::env::var("SUBCAT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(tolerance) = std::env::var("SUBCAT_SIZE_TOLERANCE_PERCENT") {
            self.scanner.size_tolerance_percent =
                tolerance.parse().map_err(|_| CatalogError::Config {
                    message: "invalid SUBCAT_SIZE_TOLERANCE_PERCENT".to_string(),
                })?;
        }
        Ok(())
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.normalizer.allowed_extensions.is_empty() {
            return Err(CatalogError::Config {
                message: "normalizer.allowed_extensions cannot be empty".to_string(),
            });
        }
        if self.search.ngram_size == 0 {
            return Err(CatalogError::Config {
                message: "search.ngram_size must be greater than zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.search.min_ngram_overlap) {
            return Err(CatalogError::Config {
                message: "search.min_ngram_overlap must be within [0, 1]".to_string(),
            });
        }
        if self.search.edit_distance_per_chars == 0 {
            return Err(CatalogError::Config {
                message: "search.edit_distance_per_chars must be greater than zero".to_string(),
            });
        }
        if self.search.default_page_size == 0
            || self.search.default_page_size > self.search.max_page_size
        {
            return Err(CatalogError::Config {
                message: "search.default_page_size must be within [1, max_page_size]".to_string(),
            });
        }
        if self.search.min_query_length > self.search.max_query_length {
            return Err(CatalogError::Config {
                message: "search.min_query_length cannot exceed max_query_length".to_string(),
            });
        }
        if self.scanner.size_tolerance_percent < 0.0
            || self.scanner.size_tolerance_percent >= 100.0
        {
            return Err(CatalogError::Config {
                message: "scanner.size_tolerance_percent must be within [0, 100)".to_string(),
            });
        }
        if self.ingestion.retry_attempts == 0 {
            return Err(CatalogError::Config {
                message: "ingestion.retry_attempts must be at least one".to_string(),
            });
        }
        Ok(())
    }

    /// Get configuration as TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CatalogError::Config {
            message: format!("failed to serialize config to TOML: {}", e),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                db_path: PathBuf::from("./data/catalog.db"),
                flush_each_commit: false,
            },
            normalizer: NormalizerConfig {
                allowed_extensions: vec![
                    "srt".to_string(),
                    "ass".to_string(),
                    "sub".to_string(),
                    "ssa".to_string(),
                    "vtt".to_string(),
                ],
                noise_patterns: vec![
                    r"@\w+".to_string(),
                    r"t\.me/\w+".to_string(),
                    r"https?://\S+".to_string(),
                    r"\[.*?\]".to_string(),
                    r"\{.*?\}".to_string(),
                ],
                min_year: 1900,
            },
            ingestion: IngestionConfig {
                retry_attempts: 3,
                retry_delay_ms: 250,
                backfill_batch_size: 100,
                rate_limit_delay_ms: 100,
            },
            search: SearchConfig {
                ngram_size: 3,
                min_ngram_overlap: 0.3,
                edit_distance_per_chars: 4,
                min_edit_tolerance: 1,
                exact_token_weight: 2.0,
                fuzzy_weight: 1.5,
                recency_weight: 0.5,
                recency_half_life_days: 30.0,
                default_page_size: 10,
                max_page_size: 50,
                min_query_length: 2,
                max_query_length: 200,
            },
            scanner: ScannerConfig {
                size_tolerance_percent: 5.0,
            },
            requests: RequestsConfig { retention_days: 30 },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_ngram_size() {
        let mut config = Config::default();
        config.search.ngram_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_excessive_size_tolerance() {
        let mut config = Config::default();
        config.scanner.size_tolerance_percent = 100.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.search.ngram_size, config.search.ngram_size);
        assert_eq!(parsed.normalizer.allowed_extensions.len(), 5);
    }
}

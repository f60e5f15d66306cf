//! # Fuzzy Query Engine Module
//!
//! ## Purpose
//! Answers free-text title queries against the index store. Combines exact
//! token matches with n-gram candidate generation and edit-distance
//! verification, so a query survives the typos and partial titles users
//! actually type.
//!
//! ## Input/Output Specification
//! - **Input**: Raw query text, page number, page size
//! - **Output**: Ranked, paginated hits over live records
//! - **Ranking**: Exact-title tier first, then token/fuzzy/recency score,
//!   download count, title, id; fully deterministic for identical input
//!
//! ## Key Features
//! - Query normalized with the same rules as record titles
//! - Typo tolerance scales with query length, floor of one edit
//! - Empty result set is a normal outcome, not an error
//! - Stable pagination over one ranked ordering

use crate::config::SearchConfig;
use crate::errors::{CatalogError, Result};
use crate::index::IndexStore;
use crate::normalize::{ngrams, tokenize, Normalizer};
use crate::{FileRecord, RecordId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use strsim::levenshtein;

/// How a hit matched the query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    /// Normalized query equals the normalized title
    Exact,
    /// Token or edit-distance match
    Fuzzy,
}

/// One ranked search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub record: FileRecord,
    pub score: f32,
    pub match_kind: MatchKind,
}

/// One page of ranked results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    /// 1-based page number this page was cut from
    pub page: usize,
    pub page_size: usize,
    /// Total matches across all pages of this query
    pub total_matches: usize,
    pub has_more: bool,
}

impl SearchPage {
    fn empty(page: usize, page_size: usize) -> Self {
        Self {
            hits: Vec::new(),
            page,
            page_size,
            total_matches: 0,
            has_more: false,
        }
    }
}

/// Fuzzy query engine over the index store
pub struct SearchEngine {
    config: SearchConfig,
    index: Arc<IndexStore>,
    normalizer: Arc<Normalizer>,
}

impl SearchEngine {
    pub fn new(config: SearchConfig, index: Arc<IndexStore>, normalizer: Arc<Normalizer>) -> Self {
        Self {
            config,
            index,
            normalizer,
        }
    }

    /// Run a query and return the requested page.
    ///
    /// `page` is 1-based (zero is treated as one); `page_size` of zero
    /// selects the configured default and is capped at the configured
    /// maximum. Query length is validated before normalization.
    pub fn search(&self, query: &str, page: usize, page_size: usize) -> Result<SearchPage> {
        let length = query.chars().count();
        if length < self.config.min_query_length {
            return Err(CatalogError::Validation {
                field: "query".to_string(),
                reason: format!(
                    "query must be at least {} characters",
                    self.config.min_query_length
                ),
            });
        }
        if length > self.config.max_query_length {
            return Err(CatalogError::Validation {
                field: "query".to_string(),
                reason: format!(
                    "query must be at most {} characters",
                    self.config.max_query_length
                ),
            });
        }

        let page = page.max(1);
        let page_size = if page_size == 0 {
            self.config.default_page_size
        } else {
            page_size.min(self.config.max_page_size)
        };

        let normalized = self.normalizer.normalize_title(query);
        if normalized.is_empty() {
            return Ok(SearchPage::empty(page, page_size));
        }

        let mut ranked = self.rank(&normalized);

        let total_matches = ranked.len();
        let start = (page - 1) * page_size;
        let hits = if start >= total_matches {
            Vec::new()
        } else {
            ranked.drain(..).skip(start).take(page_size).collect()
        };
        let has_more = start + page_size < total_matches;

        tracing::debug!(
            query = %normalized,
            total_matches,
            page,
            returned = hits.len(),
            "query answered"
        );

        Ok(SearchPage {
            hits,
            page,
            page_size,
            total_matches,
            has_more,
        })
    }

    /// Score and rank every verified candidate for a normalized query
    fn rank(&self, normalized: &str) -> Vec<SearchHit> {
        let query_tokens = tokenize(normalized);
        let query_grams = ngrams(normalized, self.config.ngram_size);

        let candidates = self.gather_candidates(&query_tokens, &query_grams);
        let now = Utc::now();

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|id| self.index.get_live(id))
            .filter_map(|record| self.verify(normalized, &query_tokens, record, now))
            .collect();

        hits.sort_by(|a, b| {
            let a_exact = a.match_kind == MatchKind::Exact;
            let b_exact = b.match_kind == MatchKind::Exact;
            b_exact
                .cmp(&a_exact)
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| b.record.download_count.cmp(&a.record.download_count))
                .then_with(|| a.record.normalized_title.cmp(&b.record.normalized_title))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        hits
    }

    /// Union of exact-token candidates and records sharing enough n-grams
    /// with the query
    fn gather_candidates(
        &self,
        query_tokens: &[String],
        query_grams: &HashSet<String>,
    ) -> HashSet<RecordId> {
        let mut candidates: HashSet<RecordId> = HashSet::new();

        for token in query_tokens {
            candidates.extend(self.index.token_candidates(token));
        }

        if !query_grams.is_empty() {
            let mut shared: HashMap<RecordId, usize> = HashMap::new();
            for gram in query_grams {
                for id in self.index.ngram_candidates(gram) {
                    *shared.entry(id).or_default() += 1;
                }
            }
            let needed = (query_grams.len() as f32 * self.config.min_ngram_overlap).ceil() as usize;
            let needed = needed.max(1);
            candidates.extend(
                shared
                    .into_iter()
                    .filter(|(_, count)| *count >= needed)
                    .map(|(id, _)| id),
            );
        }

        candidates
    }

    /// Verify a candidate against the query and compute its score.
    /// Returns `None` when the candidate survives n-gram generation but
    /// fails token and edit-distance checks.
    fn verify(
        &self,
        normalized: &str,
        query_tokens: &[String],
        record: FileRecord,
        now: chrono::DateTime<Utc>,
    ) -> Option<SearchHit> {
        if record.normalized_title == normalized {
            let score = self.config.exact_token_weight * query_tokens.len() as f32
                + self.config.fuzzy_weight
                + self.recency(&record, now);
            return Some(SearchHit {
                record,
                score,
                match_kind: MatchKind::Exact,
            });
        }

        let title_tokens = tokenize(&record.normalized_title);
        let mut exact_tokens = 0usize;
        let mut fuzzy_score = 0.0f32;
        let mut matched_any = false;

        for query_token in query_tokens {
            if title_tokens.iter().any(|t| t == query_token) {
                exact_tokens += 1;
                matched_any = true;
                continue;
            }
            // Closest title token within the typo budget for this token
            let tolerance = self.tolerance(query_token.chars().count());
            let best = title_tokens
                .iter()
                .map(|t| levenshtein(query_token, t))
                .min();
            if let Some(distance) = best {
                if distance <= tolerance {
                    matched_any = true;
                    fuzzy_score += self.config.fuzzy_weight / (1.0 + distance as f32);
                }
            }
        }

        // Whole-string comparison catches token-boundary typos
        if !matched_any {
            let distance = levenshtein(normalized, &record.normalized_title);
            if distance <= self.tolerance(normalized.chars().count()) {
                matched_any = true;
                fuzzy_score += self.config.fuzzy_weight / (1.0 + distance as f32);
            }
        }

        if !matched_any {
            return None;
        }

        let score = self.config.exact_token_weight * exact_tokens as f32
            + fuzzy_score
            + self.recency(&record, now);
        Some(SearchHit {
            record,
            score,
            match_kind: MatchKind::Fuzzy,
        })
    }

    /// One edit allowed per `edit_distance_per_chars` characters, never
    /// below the configured floor
    fn tolerance(&self, chars: usize) -> usize {
        (chars / self.config.edit_distance_per_chars).max(self.config.min_edit_tolerance)
    }

    /// Recency contribution with exponential half-life decay
    fn recency(&self, record: &FileRecord, now: chrono::DateTime<Utc>) -> f32 {
        let age_days = (now - record.indexed_at).num_seconds() as f32 / 86_400.0;
        let age_days = age_days.max(0.0);
        self.config.recency_weight * 0.5f32.powf(age_days / self.config.recency_half_life_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::CatalogStore;
    use crate::RecordStatus;

    struct Fixture {
        engine: SearchEngine,
        index: Arc<IndexStore>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("catalog.db");

        let store = Arc::new(CatalogStore::open(config.storage.clone()).await.unwrap());
        let index = Arc::new(
            IndexStore::open(store, config.search.ngram_size)
                .await
                .unwrap(),
        );
        let normalizer = Arc::new(Normalizer::new(&config.normalizer).unwrap());
        let engine = SearchEngine::new(config.search, index.clone(), normalizer);
        Fixture {
            engine,
            index,
            _dir: dir,
        }
    }

    fn record(id: RecordId, title: &str, downloads: u64) -> FileRecord {
        FileRecord {
            id,
            raw_caption: title.to_string(),
            file_size: 30_000,
            extension: "srt".to_string(),
            normalized_title: title.to_string(),
            year: Some(1999),
            language_tag: "unknown".to_string(),
            quality_hint: None,
            indexed_at: Utc::now(),
            download_count: downloads,
            status: RecordStatus::Live,
        }
    }

    #[tokio::test]
    async fn typo_query_finds_intended_title() {
        let f = fixture().await;
        f.index.put(record(1, "the matrix", 0)).await.unwrap();
        f.index.put(record(2, "the matrix reloaded", 0)).await.unwrap();
        f.index.put(record(3, "inception", 0)).await.unwrap();

        let page = f.engine.search("matrx", 1, 10).unwrap();
        assert!(!page.hits.is_empty());
        assert_eq!(page.hits[0].record.normalized_title, "the matrix");
        assert!(page
            .hits
            .iter()
            .all(|hit| hit.record.normalized_title != "inception"));
    }

    #[tokio::test]
    async fn exact_title_outranks_fuzzy_regardless_of_downloads() {
        let f = fixture().await;
        f.index.put(record(1, "the matrix", 0)).await.unwrap();
        f.index.put(record(2, "the matrix reloaded", 5_000)).await.unwrap();

        let page = f.engine.search("the matrix", 1, 10).unwrap();
        assert_eq!(page.hits[0].record.id, 1);
        assert_eq!(page.hits[0].match_kind, MatchKind::Exact);
        assert_eq!(page.hits[1].match_kind, MatchKind::Fuzzy);
    }

    #[tokio::test]
    async fn unrelated_query_returns_empty_page() {
        let f = fixture().await;
        f.index.put(record(1, "the matrix", 0)).await.unwrap();

        let page = f.engine.search("inception", 1, 10).unwrap();
        assert!(page.hits.is_empty());
        assert_eq!(page.total_matches, 0);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn pages_are_disjoint_and_ordered() {
        let f = fixture().await;
        for (id, title) in [
            (1, "alien covenant"),
            (2, "alien resurrection"),
            (3, "alien romulus"),
            (4, "alien earth"),
            (5, "alien isolation"),
        ] {
            f.index.put(record(id, title, 0)).await.unwrap();
        }

        let first = f.engine.search("alien", 1, 2).unwrap();
        let second = f.engine.search("alien", 2, 2).unwrap();
        let third = f.engine.search("alien", 3, 2).unwrap();

        assert_eq!(first.total_matches, 5);
        assert!(first.has_more);
        assert!(second.has_more);
        assert!(!third.has_more);
        assert_eq!(first.hits.len(), 2);
        assert_eq!(second.hits.len(), 2);
        assert_eq!(third.hits.len(), 1);

        let mut seen: Vec<RecordId> = Vec::new();
        for page in [&first, &second, &third] {
            for hit in &page.hits {
                assert!(!seen.contains(&hit.record.id));
                seen.push(hit.record.id);
            }
        }
        // Same score and downloads: title breaks the tie alphabetically
        assert_eq!(seen[0], 1);
    }

    #[tokio::test]
    async fn rejects_out_of_range_query_length() {
        let f = fixture().await;
        assert!(matches!(
            f.engine.search("a", 1, 10),
            Err(CatalogError::Validation { .. })
        ));
        let long = "x".repeat(500);
        assert!(matches!(
            f.engine.search(&long, 1, 10),
            Err(CatalogError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn superseded_records_never_surface() {
        let f = fixture().await;
        f.index.put(record(1, "dune", 0)).await.unwrap();
        f.index.put(record(2, "dune", 0)).await.unwrap();
        f.index.supersede(1, 2).await.unwrap();

        let page = f.engine.search("dune", 1, 10).unwrap();
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].record.id, 2);
    }
}

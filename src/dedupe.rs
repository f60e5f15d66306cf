//! # Duplicate Scanner Module
//!
//! ## Purpose
//! Finds groups of live records that describe the same subtitle file and
//! collapses each group onto one canonical survivor. Losers are superseded,
//! never deleted, so externally held ids keep resolving.
//!
//! ## Input/Output Specification
//! - **Input**: Snapshot of live records, grouping tolerances
//! - **Output**: Duplicate groups and a scan report after application
//! - **Guarantee**: Grouping errs toward false negatives; a mismatched year
//!   or diverging size is never collapsed
//!
//! ## Key Features
//! - Grouping on normalized title, year and extension family
//! - File-size tolerance window relative to the larger file
//! - Deterministic canonical choice: downloads, then recency, then size
//! - Supersede-based resolution through the index store

use crate::config::ScannerConfig;
use crate::errors::Result;
use crate::index::IndexStore;
use crate::{DuplicateGroup, FileRecord, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of one scan-and-apply run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub records_scanned: usize,
    pub groups_found: usize,
    pub records_superseded: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Scans the live catalog for duplicate records
pub struct DuplicateScanner {
    config: ScannerConfig,
    index: Arc<IndexStore>,
}

/// Extension family for grouping: formats that are interchangeable
/// renditions of the same subtitle count as one family
fn extension_family(extension: &str) -> &str {
    match extension {
        "ssa" => "ass",
        other => other,
    }
}

impl DuplicateScanner {
    pub fn new(config: ScannerConfig, index: Arc<IndexStore>) -> Self {
        Self { config, index }
    }

    /// Find duplicate groups over a snapshot of the live catalog.
    /// Records ingested after the snapshot are not considered.
    pub fn scan(&self) -> Vec<DuplicateGroup> {
        let snapshot = self.index.live_snapshot();
        self.group(snapshot)
    }

    /// Supersede every non-canonical member of each group. Groups whose
    /// canonical record disappeared since the scan are skipped.
    pub async fn apply(&self, groups: &[DuplicateGroup]) -> Result<usize> {
        let mut superseded = 0;
        for group in groups {
            if self.index.get_live(group.canonical).is_none() {
                tracing::warn!(
                    canonical = group.canonical,
                    "canonical record no longer live, group skipped"
                );
                continue;
            }
            let losers: Vec<RecordId> = group
                .ids
                .iter()
                .copied()
                .filter(|id| *id != group.canonical && self.index.get_live(*id).is_some())
                .collect();
            if losers.is_empty() {
                continue;
            }
            self.index.supersede_group(&losers, group.canonical).await?;
            superseded += losers.len();
            tracing::info!(
                canonical = group.canonical,
                superseded = losers.len(),
                "duplicate group collapsed"
            );
        }
        Ok(superseded)
    }

    /// Full scan-and-apply pass
    pub async fn run(&self) -> Result<ScanReport> {
        let started_at = Utc::now();
        let records_scanned = self.index.live_count();
        let groups = self.scan();
        let groups_found = groups.len();
        let records_superseded = self.apply(&groups).await?;
        let report = ScanReport {
            records_scanned,
            groups_found,
            records_superseded,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            scanned = report.records_scanned,
            groups = report.groups_found,
            superseded = report.records_superseded,
            "duplicate scan finished"
        );
        Ok(report)
    }

    /// Partition records into duplicate groups.
    ///
    /// Records bucket on (normalized title, year, extension family); a
    /// missing year only buckets with other missing years. Within a
    /// bucket, records join a group while their size stays inside the
    /// tolerance window of the group's smallest member, so a chain of
    /// small steps cannot bridge genuinely different files.
    fn group(&self, records: Vec<FileRecord>) -> Vec<DuplicateGroup> {
        type BucketKey = (String, Option<i32>, String);
        let mut buckets: HashMap<BucketKey, Vec<FileRecord>> = HashMap::new();
        for record in records {
            let key = (
                record.normalized_title.clone(),
                record.year,
                extension_family(&record.extension).to_string(),
            );
            buckets.entry(key).or_default().push(record);
        }

        let mut groups = Vec::new();
        let mut keys: Vec<BucketKey> = buckets.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let mut members = match buckets.remove(&key) {
                Some(members) if members.len() > 1 => members,
                _ => continue,
            };
            members.sort_by_key(|record| (record.file_size, record.id));

            // Anchor the tolerance check on the group's smallest member;
            // a record outside the anchor's window starts a new group
            let mut current: Vec<FileRecord> = Vec::new();
            for record in members {
                let fits = match current.first() {
                    None => true,
                    Some(anchor) => self.within_tolerance(anchor.file_size, record.file_size),
                };
                if fits {
                    current.push(record);
                } else {
                    self.finish_group(&mut groups, std::mem::take(&mut current));
                    current.push(record);
                }
            }
            self.finish_group(&mut groups, current);
        }
        groups
    }

    fn finish_group(&self, groups: &mut Vec<DuplicateGroup>, members: Vec<FileRecord>) {
        if members.len() < 2 {
            return;
        }
        let canonical = Self::choose_canonical(&members);
        let mut ids: Vec<RecordId> = members.iter().map(|record| record.id).collect();
        ids.sort_unstable();
        groups.push(DuplicateGroup { ids, canonical });
    }

    /// Sizes match when the smaller is within the tolerance percentage of
    /// the larger
    fn within_tolerance(&self, a: u64, b: u64) -> bool {
        let larger = a.max(b);
        let smaller = a.min(b);
        if larger == 0 {
            return true;
        }
        let divergence = (larger - smaller) as f32 / larger as f32 * 100.0;
        divergence <= self.config.size_tolerance_percent
    }

    /// Survivor preference: most downloaded, then newest, then largest,
    /// then lowest id. Total order, so repeated scans pick the same record.
    fn choose_canonical(members: &[FileRecord]) -> RecordId {
        let mut best = &members[0];
        for candidate in &members[1..] {
            let better = candidate
                .download_count
                .cmp(&best.download_count)
                .then_with(|| candidate.indexed_at.cmp(&best.indexed_at))
                .then_with(|| candidate.file_size.cmp(&best.file_size))
                .then_with(|| best.id.cmp(&candidate.id));
            if better == std::cmp::Ordering::Greater {
                best = candidate;
            }
        }
        best.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StorageConfig};
    use crate::storage::CatalogStore;
    use crate::RecordStatus;
    use chrono::Duration;

    async fn scanner(dir: &tempfile::TempDir) -> (DuplicateScanner, Arc<IndexStore>) {
        let store = Arc::new(
            CatalogStore::open(StorageConfig {
                db_path: dir.path().join("catalog.db"),
                flush_each_commit: false,
            })
            .await
            .unwrap(),
        );
        let index = Arc::new(IndexStore::open(store, 3).await.unwrap());
        let scanner = DuplicateScanner::new(Config::default().scanner, index.clone());
        (scanner, index)
    }

    fn record(
        id: RecordId,
        title: &str,
        year: Option<i32>,
        extension: &str,
        size: u64,
        downloads: u64,
        age_days: i64,
    ) -> FileRecord {
        FileRecord {
            id,
            raw_caption: title.to_string(),
            file_size: size,
            extension: extension.to_string(),
            normalized_title: title.to_string(),
            year,
            language_tag: "unknown".to_string(),
            quality_hint: None,
            indexed_at: Utc::now() - Duration::days(age_days),
            download_count: downloads,
            status: RecordStatus::Live,
        }
    }

    #[tokio::test]
    async fn groups_matching_records_within_size_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let (scanner, index) = scanner(&dir).await;

        index
            .put(record(1, "the matrix", Some(1999), "srt", 100_000, 0, 2))
            .await
            .unwrap();
        index
            .put(record(2, "the matrix", Some(1999), "srt", 102_000, 0, 1))
            .await
            .unwrap();
        // Same title but far larger: a different cut, not a duplicate
        index
            .put(record(3, "the matrix", Some(1999), "srt", 200_000, 0, 0))
            .await
            .unwrap();

        let groups = scanner.scan();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn small_size_steps_do_not_bridge_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let (scanner, index) = scanner(&dir).await;

        // Each neighbor is within 5% of the previous, but the extremes
        // diverge by more than the tolerance
        index
            .put(record(1, "the matrix", Some(1999), "srt", 100_000, 0, 0))
            .await
            .unwrap();
        index
            .put(record(2, "the matrix", Some(1999), "srt", 104_000, 0, 0))
            .await
            .unwrap();
        index
            .put(record(3, "the matrix", Some(1999), "srt", 108_000, 0, 0))
            .await
            .unwrap();

        let groups = scanner.scan();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn year_mismatch_is_never_grouped() {
        let dir = tempfile::tempdir().unwrap();
        let (scanner, index) = scanner(&dir).await;

        index
            .put(record(1, "dune", Some(1984), "srt", 50_000, 0, 0))
            .await
            .unwrap();
        index
            .put(record(2, "dune", Some(2021), "srt", 50_000, 0, 0))
            .await
            .unwrap();
        index
            .put(record(3, "dune", None, "srt", 50_000, 0, 0))
            .await
            .unwrap();

        assert!(scanner.scan().is_empty());
    }

    #[tokio::test]
    async fn ass_and_ssa_share_an_extension_family() {
        let dir = tempfile::tempdir().unwrap();
        let (scanner, index) = scanner(&dir).await;

        index
            .put(record(1, "akira", Some(1988), "ass", 80_000, 0, 0))
            .await
            .unwrap();
        index
            .put(record(2, "akira", Some(1988), "ssa", 80_500, 0, 0))
            .await
            .unwrap();
        index
            .put(record(3, "akira", Some(1988), "srt", 80_000, 0, 0))
            .await
            .unwrap();

        let groups = scanner.scan();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn canonical_prefers_downloads_then_recency_then_size() {
        let dir = tempfile::tempdir().unwrap();
        let (scanner, index) = scanner(&dir).await;

        index
            .put(record(1, "heat", Some(1995), "srt", 99_000, 10, 0))
            .await
            .unwrap();
        index
            .put(record(2, "heat", Some(1995), "srt", 100_000, 3, 0))
            .await
            .unwrap();

        let groups = scanner.scan();
        assert_eq!(groups[0].canonical, 1);
        // Rescanning an unchanged catalog picks the same survivor
        assert_eq!(scanner.scan(), groups);

        // Equal downloads: newest wins even when smaller
        let dir = tempfile::tempdir().unwrap();
        let (scanner, index) = self::scanner(&dir).await;
        index
            .put(record(1, "heat", Some(1995), "srt", 100_000, 0, 5))
            .await
            .unwrap();
        index
            .put(record(2, "heat", Some(1995), "srt", 99_000, 0, 0))
            .await
            .unwrap();
        assert_eq!(scanner.scan()[0].canonical, 2);
    }

    #[tokio::test]
    async fn apply_supersedes_losers_and_keeps_ids_resolvable() {
        let dir = tempfile::tempdir().unwrap();
        let (scanner, index) = scanner(&dir).await;

        index
            .put(record(1, "se7en", Some(1995), "srt", 60_000, 0, 1))
            .await
            .unwrap();
        index
            .put(record(2, "se7en", Some(1995), "srt", 60_100, 0, 0))
            .await
            .unwrap();

        let report = scanner.run().await.unwrap();
        assert_eq!(report.groups_found, 1);
        assert_eq!(report.records_superseded, 1);

        assert!(index.get_live(1).is_none());
        assert_eq!(index.resolve_canonical(1).unwrap().id, 2);
        // Repeated runs find nothing further
        let again = scanner.run().await.unwrap();
        assert_eq!(again.groups_found, 0);
    }
}

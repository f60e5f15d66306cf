//! # Metadata Normalizer Module
//!
//! ## Purpose
//! Turns raw file announcements (caption text, filename fallback, size) into
//! canonical record drafts: extracted title, year, language tag, quality hint
//! and the normalized search key the whole index depends on.
//!
//! ## Input/Output Specification
//! - **Input**: Raw announcement (caption, filename, size)
//! - **Output**: `RecordDraft` ready to be committed, or a validation error
//! - **Determinism**: Pure function of its input; identical announcements
//!   always normalize identically so reindexing is idempotent
//!
//! ## Key Features
//! - Noise stripping (release-group tags, channel handles, URLs, brackets)
//! - Year extraction bounded to a plausible range
//! - Language tagging from explicit caption markers
//! - Quality/resolution hint extraction
//! - Diacritic folding and punctuation stripping for the search key

use crate::config::NormalizerConfig;
use crate::errors::{CatalogError, Result};
use crate::{FileRecord, RecordId, RecordStatus};
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

/// One raw announcement delivered by the ingestion source
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RawAnnouncement {
    /// Caption text attached to the file, when present
    pub caption: Option<String>,
    /// Original filename
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
}

impl RawAnnouncement {
    /// Text the normalizer works from: caption when present, filename otherwise
    fn source_text(&self) -> &str {
        match &self.caption {
            Some(caption) if !caption.trim().is_empty() => caption,
            _ => &self.file_name,
        }
    }
}

/// Normalized metadata extracted from one announcement, not yet committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    pub normalized_title: String,
    pub year: Option<i32>,
    pub language_tag: String,
    pub quality_hint: Option<String>,
    pub extension: String,
}

impl RecordDraft {
    /// Build the full record committed by the ingestion pipeline
    pub fn into_record(
        self,
        id: RecordId,
        raw: &RawAnnouncement,
        indexed_at: DateTime<Utc>,
    ) -> FileRecord {
        FileRecord {
            id,
            raw_caption: raw.source_text().to_string(),
            file_size: raw.file_size,
            extension: self.extension,
            normalized_title: self.normalized_title,
            year: self.year,
            language_tag: self.language_tag,
            quality_hint: self.quality_hint,
            indexed_at,
            download_count: 0,
            status: RecordStatus::Live,
        }
    }
}

/// Metadata normalizer with compiled extraction patterns
pub struct Normalizer {
    allowed_extensions: HashSet<String>,
    noise_patterns: Vec<Regex>,
    extension_pattern: Regex,
    year_pattern: Regex,
    quality_patterns: Vec<Regex>,
    language_markers: Vec<(Regex, &'static str)>,
    min_year: i32,
}

impl Normalizer {
    /// Compile extraction patterns from configuration
    pub fn new(config: &NormalizerConfig) -> Result<Self> {
        let mut noise_patterns = Vec::with_capacity(config.noise_patterns.len());
        for pattern in &config.noise_patterns {
            let compiled = Regex::new(pattern).map_err(|e| CatalogError::Config {
                message: format!("invalid noise pattern '{}': {}", pattern, e),
            })?;
            noise_patterns.push(compiled);
        }

        let extension_alternation = config
            .allowed_extensions
            .iter()
            .map(|ext| regex::escape(ext))
            .collect::<Vec<_>>()
            .join("|");
        let extension_pattern = Regex::new(&format!(r"(?i)\.({})\b", extension_alternation))
            .map_err(|e| CatalogError::Config {
                message: format!("failed to build extension pattern: {}", e),
            })?;

        let quality_patterns = [
            r"(?i)\b(4K|2160p|1080p|720p|480p|360p)\b",
            r"(?i)\b(BluRay|BRRip|WEBRip|WEB-DL|HDRip|DVDRip|CAMRip)\b",
            r"(?i)\b(HEVC|x264|x265|H\.264|H\.265)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static quality pattern"))
        .collect();

        let language_markers = [
            (r"(?i)\b(sinhala|sin|si)\b", "sinhala"),
            (r"(?i)\b(english|eng|en)\b", "english"),
            (r"(?i)\b(tamil|tam)\b", "tamil"),
            (r"(?i)\b(hindi|hin)\b", "hindi"),
            (r"(?i)\b(korean|kor)\b", "korean"),
        ]
        .iter()
        .map(|(p, tag)| (Regex::new(p).expect("static language pattern"), *tag))
        .collect();

        Ok(Self {
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|ext| ext.to_lowercase())
                .collect(),
            noise_patterns,
            extension_pattern,
            year_pattern: Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("static year pattern"),
            quality_patterns,
            language_markers,
            min_year: config.min_year,
        })
    }

    /// Normalize one announcement into a record draft.
    ///
    /// Rejects announcements whose extension is not an allowed subtitle
    /// format, and announcements whose title is empty after stripping.
    pub fn normalize(&self, raw: &RawAnnouncement) -> Result<RecordDraft> {
        let extension = self.extract_extension(&raw.file_name)?;
        let text = raw.source_text();

        let year = self.extract_year(text);
        let quality_hint = self.extract_quality(text);
        let language_tag = self.extract_language(text);
        let normalized_title = self.normalize_title(text);

        if normalized_title.is_empty() {
            return Err(CatalogError::Validation {
                field: "title".to_string(),
                reason: format!("empty after stripping: '{}'", raw.file_name),
            });
        }

        Ok(RecordDraft {
            normalized_title,
            year,
            language_tag,
            quality_hint,
            extension,
        })
    }

    /// Canonical search key: noise stripped, quality/year tokens removed,
    /// diacritics folded, lowercased, punctuation dropped, whitespace
    /// collapsed. Applied identically to titles and queries.
    pub fn normalize_title(&self, text: &str) -> String {
        let mut cleaned = self.extension_pattern.replace_all(text, " ").into_owned();
        for pattern in &self.noise_patterns {
            cleaned = pattern.replace_all(&cleaned, " ").into_owned();
        }
        for pattern in &self.quality_patterns {
            cleaned = pattern.replace_all(&cleaned, " ").into_owned();
        }

        let without_years = self.year_pattern.replace_all(&cleaned, " ");
        let folded = fold_and_strip(&break_separators(&without_years));
        if !folded.is_empty() {
            return folded;
        }

        // The title itself is year-shaped ("1917", "2012"): keep the first
        // year token as the title, still dropping any release year after it
        let mut kept_first = String::new();
        let mut seen_first = false;
        let mut rest = 0;
        for found in self.year_pattern.find_iter(&cleaned) {
            kept_first.push_str(&cleaned[rest..found.start()]);
            if !seen_first {
                kept_first.push_str(found.as_str());
                seen_first = true;
            }
            rest = found.end();
        }
        kept_first.push_str(&cleaned[rest..]);
        fold_and_strip(&break_separators(&kept_first))
    }

    /// First 4-digit token within the plausible year range
    pub fn extract_year(&self, text: &str) -> Option<i32> {
        let max_year = Utc::now().year() + 1;
        for capture in self.year_pattern.find_iter(text) {
            if let Ok(year) = capture.as_str().parse::<i32>() {
                if (self.min_year..=max_year).contains(&year) {
                    return Some(year);
                }
            }
        }
        None
    }

    /// Quality hint from resolution, source or codec markers; first match wins
    pub fn extract_quality(&self, text: &str) -> Option<String> {
        for pattern in &self.quality_patterns {
            if let Some(capture) = pattern.find(text) {
                return Some(capture.as_str().to_string());
            }
        }
        None
    }

    /// Language tag from explicit caption markers, defaulting to "unknown"
    pub fn extract_language(&self, text: &str) -> String {
        for (pattern, tag) in &self.language_markers {
            if pattern.is_match(text) {
                return (*tag).to_string();
            }
        }
        "unknown".to_string()
    }

    fn extract_extension(&self, file_name: &str) -> Result<String> {
        let extension = file_name
            .rsplit('.')
            .next()
            .filter(|ext| *ext != file_name)
            .map(|ext| ext.to_lowercase())
            .unwrap_or_default();

        if self.allowed_extensions.contains(&extension) {
            Ok(extension)
        } else {
            Err(CatalogError::Validation {
                field: "extension".to_string(),
                reason: format!("'{}' is not an allowed subtitle format", file_name),
            })
        }
    }
}

/// Separators commonly used in release names become word breaks
fn break_separators(text: &str) -> String {
    text.chars()
        .map(|c| if c == '.' || c == '_' || c == '-' { ' ' } else { c })
        .collect()
}

/// Fold diacritics to base letters, drop punctuation, lowercase, collapse
/// whitespace. NFKD decomposition followed by combining-mark removal.
fn fold_and_strip(text: &str) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();

    let stripped: String = folded
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace tokens of a normalized title or query
pub fn tokenize(normalized: &str) -> Vec<String> {
    normalized
        .split_whitespace()
        .map(|token| token.to_string())
        .collect()
}

/// Character n-grams of a normalized title, used by the fuzzy index.
/// Titles shorter than `n` yield themselves as a single gram.
pub fn ngrams(normalized: &str, n: usize) -> HashSet<String> {
    let chars: Vec<char> = normalized.chars().filter(|c| !c.is_whitespace()).collect();
    let mut grams = HashSet::new();

    if chars.is_empty() {
        return grams;
    }
    if chars.len() <= n {
        grams.insert(chars.iter().collect());
        return grams;
    }
    for window in chars.windows(n) {
        grams.insert(window.iter().collect());
    }
    grams
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn normalizer() -> Normalizer {
        Normalizer::new(&Config::default().normalizer).unwrap()
    }

    fn announcement(file_name: &str, caption: Option<&str>) -> RawAnnouncement {
        RawAnnouncement {
            caption: caption.map(|c| c.to_string()),
            file_name: file_name.to_string(),
            file_size: 50_000,
        }
    }

    #[test]
    fn normalizes_title_and_year_deterministically() {
        let norm = normalizer();
        let raw = announcement("The Matrix (1999).srt", None);

        let first = norm.normalize(&raw).unwrap();
        let second = norm.normalize(&raw).unwrap();

        assert_eq!(first.normalized_title, "the matrix");
        assert_eq!(first.year, Some(1999));
        assert_eq!(first.extension, "srt");
        assert_eq!(first, second);
    }

    #[test]
    fn folds_diacritics_to_base_letters() {
        let norm = normalizer();
        let draft = norm
            .normalize(&announcement("Amélie.2001.1080p.srt", None))
            .unwrap();
        assert_eq!(draft.normalized_title, "amelie");
        assert_eq!(draft.year, Some(2001));
        assert_eq!(draft.quality_hint.as_deref(), Some("1080p"));
    }

    #[test]
    fn strips_channel_noise_from_caption() {
        let norm = normalizer();
        let raw = announcement(
            "inception.srt",
            Some("Inception 2010 [WEBRip] @SubsChannel t.me/subschannel"),
        );
        let draft = norm.normalize(&raw).unwrap();
        assert_eq!(draft.normalized_title, "inception");
        assert_eq!(draft.year, Some(2010));
    }

    #[test]
    fn tags_language_from_caption_marker() {
        let norm = normalizer();
        let draft = norm
            .normalize(&announcement("Oldboy.2003.srt", Some("Oldboy 2003 Sinhala Sub")))
            .unwrap();
        assert_eq!(draft.language_tag, "sinhala");

        let untagged = norm.normalize(&announcement("Oldboy.2003.srt", None)).unwrap();
        assert_eq!(untagged.language_tag, "unknown");
    }

    #[test]
    fn rejects_unknown_extension() {
        let norm = normalizer();
        let err = norm.normalize(&announcement("movie.mkv", None)).unwrap_err();
        assert!(matches!(err, CatalogError::Validation { .. }));
    }

    #[test]
    fn rejects_title_that_strips_to_nothing() {
        let norm = normalizer();
        let err = norm
            .normalize(&announcement("[2160p].srt", Some("@channel [1080p]")))
            .unwrap_err();
        assert!(matches!(err, CatalogError::Validation { .. }));
    }

    #[test]
    fn year_shaped_titles_survive_normalization() {
        let norm = normalizer();
        let draft = norm
            .normalize(&announcement("1917 (2019).srt", None))
            .unwrap();
        assert_eq!(draft.normalized_title, "1917");

        let draft = norm.normalize(&announcement("2012.srt", None)).unwrap();
        assert_eq!(draft.normalized_title, "2012");
        assert_eq!(draft.year, Some(2012));

        // Metadata year still stripped when a real title is present
        let draft = norm
            .normalize(&announcement("The Matrix (1999).srt", None))
            .unwrap();
        assert_eq!(draft.normalized_title, "the matrix");
    }

    #[test]
    fn year_outside_range_is_ignored() {
        let norm = normalizer();
        assert_eq!(norm.extract_year("Metropolis 1899"), None);
        assert_eq!(norm.extract_year("Metropolis 1927"), Some(1927));
    }

    #[test]
    fn ngrams_cover_short_titles() {
        let grams = ngrams("up", 3);
        assert!(grams.contains("up"));
        assert_eq!(grams.len(), 1);

        let grams = ngrams("matrix", 3);
        assert!(grams.contains("mat"));
        assert!(grams.contains("rix"));
    }
}

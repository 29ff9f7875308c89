//! Core data models used throughout Shelf Search.
//!
//! These types represent the queries, catalog records, and ranked results
//! that flow through the matching and aggregation pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A validated, normalized search query.
///
/// Construction via [`Query::parse`] rejects empty and whitespace-only
/// input. The normalized form (trimmed, lowercased, whitespace-collapsed)
/// is what every matcher and cache key operates on; the raw form is echoed
/// back in responses.
#[derive(Debug, Clone)]
pub struct Query {
    pub raw: String,
    pub normalized: String,
    words: Vec<String>,
}

impl Query {
    /// Parse raw query text. Returns `None` for empty/whitespace-only input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let words: Vec<String> = trimmed
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        Some(Self {
            raw: trimmed.to_string(),
            normalized: words.join(" "),
            words,
        })
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn first_word(&self) -> &str {
        &self.words[0]
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }
}

/// A book in the catalog. Read-only to the search core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRecord {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub cover_url: Option<String>,
    pub isbn: Option<String>,
}

/// A chapter in the catalog. Every chapter references exactly one book.
///
/// The precomputed embedding vector lives in storage only; it is never
/// loaded into this record.
#[derive(Debug, Clone)]
pub struct ChapterRecord {
    pub id: i64,
    pub book_id: i64,
    pub title: String,
    pub text: String,
}

/// A chapter joined with its parent book, as fetched for lexical matching.
#[derive(Debug, Clone)]
pub struct ChapterCandidate {
    pub chapter: ChapterRecord,
    pub book: BookRecord,
}

/// A transient match produced by the vector or lexical matcher.
///
/// `distance` is normalized to `[0,1]` with lower = better; overlap-based
/// matchers convert their overlap metric to a pseudo-distance before
/// emitting hits, so the scorer sees a single scale.
#[derive(Debug, Clone)]
pub struct RawHit {
    pub chapter: ChapterRecord,
    pub book: BookRecord,
    pub distance: f64,
}

/// Where an enriched chapter's explanation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentSource {
    /// Not enriched (tier without enrichment).
    None,
    /// Produced by the language-model provider.
    Ai,
    /// Produced by the deterministic keyword fallback.
    Heuristic,
    /// Served from the enrichment cache.
    Cached,
}

/// A matched chapter, scored and (optionally) enriched.
///
/// Serialized camelCase: the consumer is a browser frontend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedChapter {
    pub id: i64,
    pub title: String,
    pub snippet: String,
    pub relevance_score: u8,
    pub why_relevant: String,
    pub key_topics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applications: Option<Vec<String>>,
    pub enrichment_source: EnrichmentSource,
}

/// The per-book aggregation of a search response.
///
/// `top_chapters` is never empty and holds at most `k_per_book` chapters;
/// `average_relevance` is the mean over exactly those chapters, never over
/// all raw hits for the book.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookGroup {
    pub book_id: i64,
    pub title: String,
    pub author: String,
    pub cover_url: Option<String>,
    pub isbn: Option<String>,
    pub top_chapters: Vec<EnrichedChapter>,
    pub average_relevance: f64,
}

/// The final search payload, constructed once per request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<BookGroup>,
    pub total_books: usize,
    pub total_chapters: usize,
    pub search_type: String,
    /// Allowance left after this search; `None` for unlimited plans.
    pub queries_remaining: Option<u32>,
    pub processing_time_ms: u64,
}

/// Terminal non-error outcome for an exhausted allowance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePrompt {
    pub upgrade_required: bool,
    pub message: String,
    pub plan: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_plan: Option<String>,
    pub queries_remaining: u32,
}

/// A book with nested chapters, as found in a library import file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryBook {
    pub id: i64,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
    pub chapters: Vec<LibraryChapter>,
}

/// A chapter entry in a library import file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryChapter {
    pub id: i64,
    pub title: String,
    pub text: String,
}

/// Declarative feature table attached to a tier, exposed for UI gating.
pub type FeatureTable = BTreeMap<String, bool>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_rejects_empty() {
        assert!(Query::parse("").is_none());
        assert!(Query::parse("   \t\n").is_none());
    }

    #[test]
    fn test_query_normalizes() {
        let q = Query::parse("  Radical   CANDOR ").unwrap();
        assert_eq!(q.raw, "Radical   CANDOR");
        assert_eq!(q.normalized, "radical candor");
        assert_eq!(q.word_count(), 2);
        assert_eq!(q.first_word(), "radical");
    }

    #[test]
    fn test_query_single_word() {
        let q = Query::parse("leadership").unwrap();
        assert_eq!(q.normalized, "leadership");
        assert_eq!(q.words(), &["leadership".to_string()]);
    }
}

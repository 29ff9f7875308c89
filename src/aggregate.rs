//! Result aggregation: raw hits → ranked book groups.
//!
//! Scores every hit, groups by parent book, keeps each book's top chapters,
//! and ranks books by the average score over exactly those retained
//! chapters. Averaging over the retained top-k (instead of all hits for the
//! book) rewards books with several excellent chapters over books with one
//! excellent chapter buried among many weak ones.

use std::collections::BTreeMap;

use crate::models::{BookGroup, EnrichedChapter, EnrichmentSource, RawHit};
use crate::scoring::relevance_score;

/// Aggregation knobs, wired from `[search]` config.
#[derive(Debug, Clone)]
pub struct AggregateParams {
    /// Chapters retained per book.
    pub k_per_book: usize,
    /// Books retained in the final response.
    pub max_books: usize,
    /// Noise floor on book averages. Intentionally far below the 25-point
    /// per-chapter floor; it only drops pathological groups.
    pub min_avg_score: u8,
    /// Snippet length in characters.
    pub snippet_chars: usize,
}

impl Default for AggregateParams {
    fn default() -> Self {
        Self {
            k_per_book: 3,
            max_books: 12,
            min_avg_score: 10,
            snippet_chars: 400,
        }
    }
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Aggregate scored hits into ranked book groups.
///
/// Output ordering is a strict total order — average score descending,
/// then book id ascending — so result ordering is deterministic and
/// testable. Within a group, chapters are ordered score descending, then
/// chapter id ascending.
pub fn aggregate(hits: &[RawHit], params: &AggregateParams) -> Vec<BookGroup> {
    // BTreeMap keyed by book id keeps grouping order deterministic.
    let mut by_book: BTreeMap<i64, Vec<&RawHit>> = BTreeMap::new();
    for hit in hits {
        by_book.entry(hit.book.id).or_default().push(hit);
    }

    let mut groups: Vec<BookGroup> = Vec::with_capacity(by_book.len());

    for (book_id, mut book_hits) in by_book {
        book_hits.sort_by(|a, b| {
            relevance_score(b.distance)
                .cmp(&relevance_score(a.distance))
                .then(a.chapter.id.cmp(&b.chapter.id))
        });
        book_hits.truncate(params.k_per_book);

        let top_chapters: Vec<EnrichedChapter> = book_hits
            .iter()
            .map(|hit| EnrichedChapter {
                id: hit.chapter.id,
                title: hit.chapter.title.clone(),
                snippet: snippet(&hit.chapter.text, params.snippet_chars),
                relevance_score: relevance_score(hit.distance),
                why_relevant: String::new(),
                key_topics: Vec::new(),
                principles: None,
                applications: None,
                enrichment_source: EnrichmentSource::None,
            })
            .collect();

        if top_chapters.is_empty() {
            continue;
        }

        // Average over exactly the retained chapters, never all hits.
        let average_relevance = top_chapters
            .iter()
            .map(|c| c.relevance_score as f64)
            .sum::<f64>()
            / top_chapters.len() as f64;

        if average_relevance < params.min_avg_score as f64 {
            continue;
        }

        let book = &book_hits[0].book;
        groups.push(BookGroup {
            book_id,
            title: book.title.clone(),
            author: book.author.clone(),
            cover_url: book.cover_url.clone(),
            isbn: book.isbn.clone(),
            top_chapters,
            average_relevance,
        });
    }

    groups.sort_by(|a, b| {
        b.average_relevance
            .partial_cmp(&a.average_relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.book_id.cmp(&b.book_id))
    });
    groups.truncate(params.max_books);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookRecord, ChapterRecord};

    fn hit(chapter_id: i64, book_id: i64, distance: f64) -> RawHit {
        RawHit {
            chapter: ChapterRecord {
                id: chapter_id,
                book_id,
                title: format!("Chapter {}", chapter_id),
                text: "body text".to_string(),
            },
            book: BookRecord {
                id: book_id,
                title: format!("Book {}", book_id),
                author: "Author".to_string(),
                cover_url: None,
                isbn: None,
            },
            distance,
        }
    }

    #[test]
    fn test_empty_hits_empty_groups() {
        assert!(aggregate(&[], &AggregateParams::default()).is_empty());
    }

    #[test]
    fn test_groups_by_book_and_ranks_by_average() {
        let hits = vec![hit(1, 1, 0.2), hit(2, 1, 0.4), hit(3, 2, 0.05)];
        let groups = aggregate(&hits, &AggregateParams::default());
        assert_eq!(groups.len(), 2);
        // Book 2: single chapter at 95 → average 95, ranks first.
        assert_eq!(groups[0].book_id, 2);
        assert_eq!(groups[0].average_relevance, 95.0);
        // Book 1: (80 + 65) / 2 = 72.5.
        assert_eq!(groups[1].book_id, 1);
        assert_eq!(groups[1].average_relevance, 72.5);
    }

    #[test]
    fn test_average_over_retained_top_k_only() {
        // Four hits for one book; k=3 keeps the best three (80, 80, 75) and
        // the weak 25 must not drag the average.
        let hits = vec![
            hit(1, 1, 0.2),
            hit(2, 1, 0.2),
            hit(3, 1, 0.3),
            hit(4, 1, 0.95),
        ];
        let params = AggregateParams::default();
        let groups = aggregate(&hits, &params);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].top_chapters.len(), 3);
        let expected = (80.0 + 80.0 + 75.0) / 3.0;
        assert!((groups[0].average_relevance - expected).abs() < 1e-9);
    }

    #[test]
    fn test_k_per_book_cap_and_chapter_order() {
        let hits = vec![hit(5, 1, 0.4), hit(3, 1, 0.05), hit(9, 1, 0.2)];
        let params = AggregateParams {
            k_per_book: 2,
            ..AggregateParams::default()
        };
        let groups = aggregate(&hits, &params);
        assert_eq!(groups[0].top_chapters.len(), 2);
        assert_eq!(groups[0].top_chapters[0].id, 3); // 95
        assert_eq!(groups[0].top_chapters[1].id, 9); // 80
    }

    #[test]
    fn test_tie_break_by_book_id() {
        let hits = vec![hit(1, 7, 0.2), hit(2, 3, 0.2)];
        let groups = aggregate(&hits, &AggregateParams::default());
        assert_eq!(groups[0].book_id, 3);
        assert_eq!(groups[1].book_id, 7);
    }

    #[test]
    fn test_min_avg_score_filter() {
        let params = AggregateParams {
            min_avg_score: 90,
            ..AggregateParams::default()
        };
        let hits = vec![hit(1, 1, 0.05), hit(2, 2, 0.4)];
        let groups = aggregate(&hits, &params);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].book_id, 1);
    }

    #[test]
    fn test_max_books_truncation() {
        let hits: Vec<RawHit> = (1..=20).map(|b| hit(b, b, 0.2)).collect();
        let groups = aggregate(&hits, &AggregateParams::default());
        assert_eq!(groups.len(), 12);
    }

    #[test]
    fn test_canonical_two_book_scenario() {
        // Book 1 gets chapters at 85 and 75 (average 80), book 2 a single
        // 95. The single stronger chapter outranks the pair.
        let hits = vec![hit(1, 1, 0.1), hit(2, 1, 0.3), hit(3, 2, 0.05)];
        let groups = aggregate(&hits, &AggregateParams::default());
        assert_eq!(groups[0].book_id, 2);
        assert_eq!(groups[0].average_relevance, 95.0);
        assert_eq!(groups[1].book_id, 1);
        assert_eq!(groups[1].average_relevance, 80.0);
    }

    #[test]
    fn test_snippet_char_boundary() {
        let s = snippet("héllo wörld", 7);
        assert_eq!(s, "héllo w");
        assert_eq!(snippet("short", 400), "short");
    }
}

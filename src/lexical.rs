//! Lexical fallback matching.
//!
//! When no embedding vector is available (provider down, unconfigured, or
//! the plan only permits lexical search), candidate chapters are classified
//! by substring matching into pseudo-distance buckets. Pure substring search
//! has no notion of partial relevance, so the classification is
//! priority-ordered: stronger match locations map to smaller distances,
//! which the scorer then treats exactly like vector distances.
//!
//! Classification of the normalized query against a candidate:
//!
//! 1. chapter title contains the query → 0.1
//! 2. chapter text contains the query AND the first query word is in the
//!    chapter title → 0.2
//! 3. chapter text contains the query → 0.4
//! 4. book title contains the query → 0.5
//! 5. author name contains the query → 0.6
//!
//! Candidates matching none of the above are excluded — fallback search
//! must not return arbitrary unrelated chapters. When the full-phrase pass
//! finds nothing for a multi-word query, a weaker per-word pass runs and
//! emits word-level matches at [`WEAK_MATCH_DISTANCE`].

use crate::models::{ChapterCandidate, Query, RawHit};

/// Pseudo-distance for a query found in the chapter title.
pub const TITLE_MATCH_DISTANCE: f64 = 0.1;
/// Pseudo-distance for a text match whose first query word also hits the title.
pub const TEXT_AND_TITLE_WORD_DISTANCE: f64 = 0.2;
/// Pseudo-distance for a query found in the chapter text.
pub const TEXT_MATCH_DISTANCE: f64 = 0.4;
/// Pseudo-distance for a query found in the book title.
pub const BOOK_TITLE_MATCH_DISTANCE: f64 = 0.5;
/// Pseudo-distance for a query found in the author name.
pub const AUTHOR_MATCH_DISTANCE: f64 = 0.6;
/// Pseudo-distance assigned by the weaker per-word pass.
pub const WEAK_MATCH_DISTANCE: f64 = 0.8;

/// Default cap on the number of hits handed to the scorer.
pub const DEFAULT_CANDIDATE_CAP: usize = 20;

/// Classify one candidate against the full normalized query.
///
/// Returns the pseudo-distance of the strongest matching location, or
/// `None` when nothing matches.
fn classify(query: &Query, candidate: &ChapterCandidate) -> Option<f64> {
    let chapter_title = candidate.chapter.title.to_lowercase();
    let chapter_text = candidate.chapter.text.to_lowercase();
    let book_title = candidate.book.title.to_lowercase();
    let author = candidate.book.author.to_lowercase();
    let needle = query.normalized.as_str();

    if chapter_title.contains(needle) {
        Some(TITLE_MATCH_DISTANCE)
    } else if chapter_text.contains(needle) && chapter_title.contains(query.first_word()) {
        Some(TEXT_AND_TITLE_WORD_DISTANCE)
    } else if chapter_text.contains(needle) {
        Some(TEXT_MATCH_DISTANCE)
    } else if book_title.contains(needle) {
        Some(BOOK_TITLE_MATCH_DISTANCE)
    } else if author.contains(needle) {
        Some(AUTHOR_MATCH_DISTANCE)
    } else {
        None
    }
}

/// True when any individual query word appears in any matchable field.
fn matches_any_word(query: &Query, candidate: &ChapterCandidate) -> bool {
    let chapter_title = candidate.chapter.title.to_lowercase();
    let chapter_text = candidate.chapter.text.to_lowercase();
    let book_title = candidate.book.title.to_lowercase();
    let author = candidate.book.author.to_lowercase();

    query.words().iter().any(|w| {
        chapter_title.contains(w.as_str())
            || chapter_text.contains(w.as_str())
            || book_title.contains(w.as_str())
            || author.contains(w.as_str())
    })
}

/// Match a candidate set against the query, producing capped, ordered hits.
///
/// Ordering is a strict total order — pseudo-distance ascending, then
/// chapter-text length descending, then chapter id ascending — so repeated
/// calls with the same inputs yield identical output.
pub fn match_candidates(
    query: &Query,
    candidates: &[ChapterCandidate],
    cap: usize,
) -> Vec<RawHit> {
    let mut hits: Vec<RawHit> = candidates
        .iter()
        .filter_map(|c| {
            classify(query, c).map(|distance| RawHit {
                chapter: c.chapter.clone(),
                book: c.book.clone(),
                distance,
            })
        })
        .collect();

    // Weaker heuristic path: the full phrase matched nothing, so fall back
    // to per-word matches at the weak-candidate distance.
    if hits.is_empty() && query.word_count() > 1 {
        hits = candidates
            .iter()
            .filter(|c| matches_any_word(query, c))
            .map(|c| RawHit {
                chapter: c.chapter.clone(),
                book: c.book.clone(),
                distance: WEAK_MATCH_DISTANCE,
            })
            .collect();
    }

    hits.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.chapter.text.len().cmp(&a.chapter.text.len()))
            .then(a.chapter.id.cmp(&b.chapter.id))
    });
    hits.truncate(cap);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookRecord, ChapterRecord};

    fn candidate(
        chapter_id: i64,
        chapter_title: &str,
        chapter_text: &str,
        book_title: &str,
        author: &str,
    ) -> ChapterCandidate {
        ChapterCandidate {
            chapter: ChapterRecord {
                id: chapter_id,
                book_id: 1,
                title: chapter_title.to_string(),
                text: chapter_text.to_string(),
            },
            book: BookRecord {
                id: 1,
                title: book_title.to_string(),
                author: author.to_string(),
                cover_url: None,
                isbn: None,
            },
        }
    }

    #[test]
    fn test_title_match_is_strongest() {
        let q = Query::parse("leadership").unwrap();
        let c = candidate(1, "On Leadership", "something else entirely", "B", "A");
        let hits = match_candidates(&q, &[c], 20);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].distance, TITLE_MATCH_DISTANCE);
    }

    #[test]
    fn test_text_plus_title_word_beats_text_only() {
        let q = Query::parse("leadership style").unwrap();
        let both = candidate(
            1,
            "Leadership in Practice",
            "a study of leadership style",
            "B",
            "A",
        );
        let text_only = candidate(2, "Chapter Two", "a study of leadership style", "B", "A");
        let hits = match_candidates(&q, &[text_only, both], 20);
        assert_eq!(hits[0].chapter.id, 1);
        assert_eq!(hits[0].distance, TEXT_AND_TITLE_WORD_DISTANCE);
        assert_eq!(hits[1].distance, TEXT_MATCH_DISTANCE);
    }

    #[test]
    fn test_book_title_and_author_buckets() {
        let q = Query::parse("drucker").unwrap();
        let by_book = candidate(1, "One", "text", "The Drucker Method", "Someone");
        let by_author = candidate(2, "Two", "text", "Other", "Peter Drucker");
        let hits = match_candidates(&q, &[by_author.clone(), by_book.clone()], 20);
        assert_eq!(hits[0].chapter.id, 1);
        assert_eq!(hits[0].distance, BOOK_TITLE_MATCH_DISTANCE);
        assert_eq!(hits[1].distance, AUTHOR_MATCH_DISTANCE);
    }

    #[test]
    fn test_non_matching_candidates_excluded() {
        let q = Query::parse("negotiation").unwrap();
        let c = candidate(1, "Gardening", "soil and compost", "Plants", "Green");
        assert!(match_candidates(&q, &[c], 20).is_empty());
    }

    #[test]
    fn test_weak_pass_only_when_phrase_misses() {
        let q = Query::parse("radical candor feedback").unwrap();
        let c = candidate(1, "On Candor", "giving feedback well", "B", "A");
        let hits = match_candidates(&q, &[c], 20);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].distance, WEAK_MATCH_DISTANCE);
    }

    #[test]
    fn test_weak_pass_not_used_for_single_word_query() {
        let q = Query::parse("strategy").unwrap();
        let c = candidate(1, "Unrelated", "nothing here", "B", "A");
        assert!(match_candidates(&q, &[c], 20).is_empty());
    }

    #[test]
    fn test_tie_break_longer_text_first_then_id() {
        let q = Query::parse("focus").unwrap();
        let short = candidate(1, "Focus", "short", "B", "A");
        let long = candidate(2, "Deep Focus", "a much longer body of chapter text", "B", "A");
        let hits = match_candidates(&q, &[short, long], 20);
        assert_eq!(hits[0].chapter.id, 2);
        assert_eq!(hits[1].chapter.id, 1);
    }

    #[test]
    fn test_deterministic_ordering() {
        let q = Query::parse("growth mindset").unwrap();
        let candidates: Vec<ChapterCandidate> = (0..8)
            .map(|i| {
                candidate(
                    i,
                    &format!("Chapter {}", i),
                    "growth mindset in teams",
                    "Mindset",
                    "Dweck",
                )
            })
            .collect();
        let a = match_candidates(&q, &candidates, 20);
        let b = match_candidates(&q, &candidates, 20);
        let ids_a: Vec<i64> = a.iter().map(|h| h.chapter.id).collect();
        let ids_b: Vec<i64> = b.iter().map(|h| h.chapter.id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_cap_applied() {
        let q = Query::parse("habit").unwrap();
        let candidates: Vec<ChapterCandidate> = (0..30)
            .map(|i| candidate(i, "On Habit", "habit text", "Habits", "Clear"))
            .collect();
        let hits = match_candidates(&q, &candidates, DEFAULT_CANDIDATE_CAP);
        assert_eq!(hits.len(), DEFAULT_CANDIDATE_CAP);
    }
}

//! Storage access for the search core.
//!
//! The pipeline never touches SQL directly; it consumes the [`Store`]
//! trait, which keeps the orchestrator deterministic under test (inject a
//! fake) and leaves the storage engine replaceable. [`SqliteStore`] is the
//! shipped implementation.
//!
//! Store failures are fatal to a request — unlike the embedding and
//! enrichment providers there is no fallback for an unreachable catalog.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use crate::models::{BookRecord, ChapterCandidate, ChapterRecord, Query, RawHit};

#[async_trait]
pub trait Store: Send + Sync {
    /// Chapters joined with their books, substring-filtered on chapter
    /// title/text, book title, and author. Over-fetches deliberately: the
    /// lexical matcher re-classifies candidates precisely.
    async fn lexical_candidates(
        &self,
        query: &Query,
        fetch_limit: i64,
    ) -> Result<Vec<ChapterCandidate>>;

    /// Distance-ordered hits over chapters with stored embeddings. Returns
    /// an empty vector when no embeddings exist, which the orchestrator
    /// treats as "vector index unavailable".
    async fn vector_candidates(&self, query_vec: &[f32], limit: i64) -> Result<Vec<RawHit>>;

    /// Queries consumed by a subscriber this billing period.
    async fn usage_count(&self, subscriber: &str) -> Result<u32>;

    /// Atomically increment a subscriber's usage and return the new count.
    async fn increment_usage(&self, subscriber: &str) -> Result<u32>;

    async fn upsert_book(&self, book: &BookRecord) -> Result<()>;

    async fn upsert_chapter(&self, chapter: &ChapterRecord) -> Result<()>;

    /// Chapters lacking an embedding for `model`.
    async fn chapters_missing_embedding(
        &self,
        model: &str,
        limit: Option<i64>,
    ) -> Result<Vec<ChapterRecord>>;

    async fn store_chapter_embedding(
        &self,
        chapter_id: i64,
        model: &str,
        vector: &[f32],
    ) -> Result<()>;

    async fn clear_embeddings(&self) -> Result<()>;
}

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn candidate_from_row(row: &sqlx::sqlite::SqliteRow) -> ChapterCandidate {
    ChapterCandidate {
        chapter: ChapterRecord {
            id: row.get("chapter_id"),
            book_id: row.get("book_id"),
            title: row.get("chapter_title"),
            text: row.get("chapter_text"),
        },
        book: BookRecord {
            id: row.get("book_id"),
            title: row.get("book_title"),
            author: row.get("author"),
            cover_url: row.get("cover_url"),
            isbn: row.get("isbn"),
        },
    }
}

const CANDIDATE_SELECT: &str = r#"
    SELECT c.id AS chapter_id, c.book_id AS book_id,
           c.title AS chapter_title, c.text AS chapter_text,
           b.title AS book_title, b.author AS author,
           b.cover_url AS cover_url, b.isbn AS isbn
    FROM chapters c
    JOIN books b ON b.id = c.book_id
"#;

#[async_trait]
impl Store for SqliteStore {
    async fn lexical_candidates(
        &self,
        query: &Query,
        fetch_limit: i64,
    ) -> Result<Vec<ChapterCandidate>> {
        // One pass per pattern: the full phrase, then each word of a
        // multi-word query (feeds the matcher's weak per-word pass).
        let mut patterns: Vec<String> = vec![format!("%{}%", query.normalized)];
        if query.word_count() > 1 {
            patterns.extend(query.words().iter().map(|w| format!("%{}%", w)));
        }

        let mut candidates: Vec<ChapterCandidate> = Vec::new();
        for pattern in &patterns {
            let sql = format!(
                "{} WHERE LOWER(c.title) LIKE ? OR LOWER(c.text) LIKE ? \
                 OR LOWER(b.title) LIKE ? OR LOWER(b.author) LIKE ? \
                 ORDER BY c.id LIMIT ?",
                CANDIDATE_SELECT
            );
            let rows = sqlx::query(&sql)
                .bind(pattern)
                .bind(pattern)
                .bind(pattern)
                .bind(pattern)
                .bind(fetch_limit)
                .fetch_all(&self.pool)
                .await?;

            for row in &rows {
                let candidate = candidate_from_row(row);
                if !candidates
                    .iter()
                    .any(|c| c.chapter.id == candidate.chapter.id)
                {
                    candidates.push(candidate);
                }
            }
        }

        Ok(candidates)
    }

    async fn vector_candidates(&self, query_vec: &[f32], limit: i64) -> Result<Vec<RawHit>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chapter_id, c.book_id AS book_id,
                   c.title AS chapter_title, c.text AS chapter_text,
                   c.embedding AS chapter_embedding,
                   b.title AS book_title, b.author AS author,
                   b.cover_url AS cover_url, b.isbn AS isbn
            FROM chapters c
            JOIN books b ON b.id = c.book_id
            WHERE c.embedding IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<RawHit> = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("chapter_embedding");
            let vec = blob_to_vec(&blob);
            let candidate = candidate_from_row(row);
            hits.push(RawHit {
                distance: cosine_distance(query_vec, &vec),
                chapter: candidate.chapter,
                book: candidate.book,
            });
        }

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chapter.id.cmp(&b.chapter.id))
        });
        hits.truncate(limit as usize);

        Ok(hits)
    }

    async fn usage_count(&self, subscriber: &str) -> Result<u32> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT queries_used FROM usage_counters WHERE subscriber = ?")
                .bind(subscriber)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0) as u32)
    }

    async fn increment_usage(&self, subscriber: &str) -> Result<u32> {
        // Single-statement increment-and-read: no lost updates under
        // concurrent searches by the same subscriber.
        let now = chrono::Utc::now().timestamp();
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO usage_counters (subscriber, queries_used, updated_at)
            VALUES (?, 1, ?)
            ON CONFLICT(subscriber) DO UPDATE SET
                queries_used = queries_used + 1,
                updated_at = excluded.updated_at
            RETURNING queries_used
            "#,
        )
        .bind(subscriber)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn upsert_book(&self, book: &BookRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO books (id, title, author, cover_url, isbn)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                author = excluded.author,
                cover_url = excluded.cover_url,
                isbn = excluded.isbn
            "#,
        )
        .bind(book.id)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.cover_url)
        .bind(&book.isbn)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_chapter(&self, chapter: &ChapterRecord) -> Result<()> {
        // Re-imported text invalidates any stored embedding.
        sqlx::query(
            r#"
            INSERT INTO chapters (id, book_id, title, text)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                book_id = excluded.book_id,
                title = excluded.title,
                text = excluded.text,
                embedding = CASE
                    WHEN chapters.text = excluded.text THEN chapters.embedding
                    ELSE NULL
                END,
                embedding_model = CASE
                    WHEN chapters.text = excluded.text THEN chapters.embedding_model
                    ELSE NULL
                END
            "#,
        )
        .bind(chapter.id)
        .bind(chapter.book_id)
        .bind(&chapter.title)
        .bind(&chapter.text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn chapters_missing_embedding(
        &self,
        model: &str,
        limit: Option<i64>,
    ) -> Result<Vec<ChapterRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, book_id, title, text
            FROM chapters
            WHERE embedding IS NULL OR embedding_model IS NOT ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(model)
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChapterRecord {
                id: row.get("id"),
                book_id: row.get("book_id"),
                title: row.get("title"),
                text: row.get("text"),
            })
            .collect())
    }

    async fn store_chapter_embedding(
        &self,
        chapter_id: i64,
        model: &str,
        vector: &[f32],
    ) -> Result<()> {
        let blob = vec_to_blob(vector);
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE chapters SET embedding = ?, embedding_model = ?, embedded_at = ? WHERE id = ?",
        )
        .bind(&blob)
        .bind(model)
        .bind(now)
        .bind(chapter_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_embeddings(&self) -> Result<()> {
        sqlx::query(
            "UPDATE chapters SET embedding = NULL, embedding_model = NULL, embedded_at = NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

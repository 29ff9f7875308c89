//! Library import: load a JSON catalog of books and chapters into storage.
//!
//! The import file is an array of books, each with nested chapters:
//!
//! ```json
//! [
//!   {
//!     "id": 1,
//!     "title": "Good to Great",
//!     "author": "Jim Collins",
//!     "isbn": "978-0066620992",
//!     "chapters": [
//!       { "id": 11, "title": "Level 5 Leadership", "text": "..." }
//!     ]
//!   }
//! ]
//! ```
//!
//! Import is idempotent: rows are upserted by id, and a chapter whose text
//! changed loses its stored embedding so `shelf embed pending` picks it up
//! again.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::models::{BookRecord, ChapterRecord, LibraryBook};
use crate::store::{SqliteStore, Store};

pub async fn run_import(config: &Config, path: &Path, dry_run: bool) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read library file: {}", path.display()))?;
    let books: Vec<LibraryBook> =
        serde_json::from_str(&content).with_context(|| "Failed to parse library file")?;

    for book in &books {
        for chapter in &book.chapters {
            if chapter.text.trim().is_empty() {
                anyhow::bail!(
                    "chapter {} of book {} ('{}') has empty text",
                    chapter.id,
                    book.id,
                    book.title
                );
            }
        }
    }

    let total_chapters: usize = books.iter().map(|b| b.chapters.len()).sum();

    if dry_run {
        println!("import {} (dry-run)", path.display());
        println!("  books: {}", books.len());
        println!("  chapters: {}", total_chapters);
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let mut books_upserted = 0u64;
    let mut chapters_upserted = 0u64;

    for book in &books {
        store
            .upsert_book(&BookRecord {
                id: book.id,
                title: book.title.clone(),
                author: book.author.clone(),
                cover_url: book.cover_url.clone(),
                isbn: book.isbn.clone(),
            })
            .await?;
        books_upserted += 1;

        for chapter in &book.chapters {
            store
                .upsert_chapter(&ChapterRecord {
                    id: chapter.id,
                    book_id: book.id,
                    title: chapter.title.clone(),
                    text: chapter.text.clone(),
                })
                .await?;
            chapters_upserted += 1;
        }
    }

    println!("import {}", path.display());
    println!("  upserted books: {}", books_upserted);
    println!("  upserted chapters: {}", chapters_upserted);
    println!("  ok");

    pool.close().await;
    Ok(())
}

//! Embedding backfill for chapter vectors.
//!
//! The search path assumes chapter embeddings are precomputed; these
//! commands populate them. A failed chapter is skipped with a warning, not
//! fatal — re-running `shelf embed pending` resumes where it left off.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::embedding::{self, Embedder};
use crate::store::{SqliteStore, Store};

/// Embed chapters that are missing a vector or were embedded with a
/// different model.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<i64>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let embedder = embedding::create_embedder(&config.embedding);
    let model_name = embedder.model_name().to_string();
    if model_name == "disabled" {
        bail!("Embedding provider could not be initialized; check model, dims, and OPENAI_API_KEY.");
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let pending = store.chapters_missing_embedding(&model_name, limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chapters needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all chapters up to date");
        pool.close().await;
        return Ok(());
    }

    let (embedded, failed) = embed_chapters(&store, embedder.as_ref(), &model_name, &pending).await;

    println!("embed pending");
    println!("  total pending: {}", pending.len());
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Delete all chapter embeddings and regenerate from scratch. Useful when
/// switching embedding models or dimensions.
pub async fn run_embed_rebuild(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let embedder = embedding::create_embedder(&config.embedding);
    let model_name = embedder.model_name().to_string();
    if model_name == "disabled" {
        bail!("Embedding provider could not be initialized; check model, dims, and OPENAI_API_KEY.");
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    store.clear_embeddings().await?;
    println!("embed rebuild — cleared existing embeddings");

    let all = store.chapters_missing_embedding(&model_name, None).await?;
    if all.is_empty() {
        println!("  no chapters to embed");
        pool.close().await;
        return Ok(());
    }

    let (embedded, failed) = embed_chapters(&store, embedder.as_ref(), &model_name, &all).await;

    println!("  total: {}", all.len());
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

async fn embed_chapters(
    store: &SqliteStore,
    embedder: &dyn Embedder,
    model_name: &str,
    chapters: &[crate::models::ChapterRecord],
) -> (u64, u64) {
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for chapter in chapters {
        // Title plus body: titles carry a lot of the topical signal in
        // short-text embedding space.
        let input = format!("{}\n\n{}", chapter.title, chapter.text);
        match embedder.embed(&input).await {
            Ok(vector) => {
                match store
                    .store_chapter_embedding(chapter.id, model_name, &vector)
                    .await
                {
                    Ok(()) => embedded += 1,
                    Err(e) => {
                        tracing::warn!("storing embedding for chapter {} failed: {}", chapter.id, e);
                        failed += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("embedding chapter {} failed: {}", chapter.id, e);
                failed += 1;
            }
        }
    }

    (embedded, failed)
}

//! Search orchestration: the single entry point behind the CLI and HTTP API.
//!
//! The pipeline is a linear state machine with one two-path fallback:
//!
//! ```text
//! validate ─▶ tier policy ─▶ embed + vector query ─▶ aggregate ─▶ enrich ─▶ count ─▶ respond
//!                │                  │ (unavailable / empty / timeout)
//!                │ (exhausted)      ▼
//!                ▼             lexical matcher
//!          upgrade prompt
//! ```
//!
//! All collaborators — store, embedder, enricher — are injected at
//! construction, so tests drive the whole pipeline with fakes. Degradable
//! failures (embedding down, vector index empty, enrichment down) never
//! fail a request; they are visible only through the response's
//! `searchType` and per-chapter `enrichmentSource` metadata. Storage
//! failures are fatal — there is no second catalog to fall back to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregate::{aggregate, AggregateParams};
use crate::cache::QueryCache;
use crate::config::Config;
use crate::embedding::{EmbedError, Embedder};
use crate::enrich::{enrich_chapter, AppliedEnrichment, Enricher};
use crate::error::SearchError;
use crate::lexical::match_candidates;
use crate::models::{BookGroup, Query, RawHit, SearchResponse, UpgradePrompt};
use crate::store::Store;
use crate::tier::{EnrichmentDepth, SearchMethod, TierCatalog};

/// `searchType` reported when the vector path produced the results.
pub const AI_VECTOR_SEARCH: &str = "ai_vector_search";
/// `searchType` reported for the lexical path, whether chosen by the plan
/// or reached through the fallback.
pub const ENHANCED_SEMANTIC_FALLBACK: &str = "enhanced_semantic_fallback";

/// One search request as received from the API layer.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub plan: String,
    pub subscriber: String,
    /// Caller-tracked usage; when present it feeds the tier policy instead
    /// of the stored counter. The post-search increment always goes to the
    /// stored counter.
    pub usage_count: Option<u32>,
    /// Explicit method override, honored when the plan permits it.
    pub method: Option<SearchMethod>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            plan: plan.into(),
            subscriber: "anonymous".to_string(),
            usage_count: None,
            method: None,
        }
    }
}

/// The two terminal non-error outcomes of a search.
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Results(SearchResponse),
    UpgradeRequired(UpgradePrompt),
}

/// Tuning knobs for the pipeline, wired from config.
#[derive(Debug, Clone)]
pub struct SearchTuning {
    pub aggregate: AggregateParams,
    /// Cap on lexical hits handed to the scorer.
    pub candidate_cap: usize,
    /// Rows fetched per substring pattern.
    pub lexical_fetch_limit: i64,
    /// Hits taken from the vector index.
    pub vector_candidates: i64,
    /// Budget for the query-embedding step; overrunning it triggers the
    /// lexical fallback, not a request failure.
    pub embed_timeout: Duration,
    /// Budget per enrichment call; overrunning it degrades that chapter.
    pub enrich_timeout: Duration,
    pub enrich_concurrency: usize,
    pub embed_cache_entries: usize,
    pub enrich_cache_entries: usize,
}

impl Default for SearchTuning {
    fn default() -> Self {
        Self {
            aggregate: AggregateParams::default(),
            candidate_cap: 20,
            lexical_fetch_limit: 200,
            vector_candidates: 40,
            embed_timeout: Duration::from_secs(30),
            enrich_timeout: Duration::from_secs(20),
            enrich_concurrency: 4,
            embed_cache_entries: 512,
            enrich_cache_entries: 512,
        }
    }
}

impl SearchTuning {
    pub fn from_config(config: &Config) -> Self {
        Self {
            aggregate: AggregateParams {
                k_per_book: config.search.k_per_book,
                max_books: config.search.max_books,
                min_avg_score: config.search.min_avg_score,
                snippet_chars: config.search.snippet_chars,
            },
            candidate_cap: config.search.candidate_cap,
            lexical_fetch_limit: config.search.lexical_fetch_limit,
            vector_candidates: config.search.vector_candidates,
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            enrich_timeout: Duration::from_secs(config.enrichment.timeout_secs),
            enrich_concurrency: config.enrichment.max_concurrency,
            embed_cache_entries: config.embedding.cache_max_entries,
            enrich_cache_entries: config.enrichment.cache_max_entries,
        }
    }
}

/// The assembled pipeline. Shared across requests behind an `Arc`; the only
/// mutable state is the two caches and the persisted usage counter.
pub struct SearchEngine {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    enricher: Arc<dyn Enricher>,
    tiers: TierCatalog,
    embed_cache: Arc<QueryCache<Vec<f32>>>,
    enrich_cache: Arc<QueryCache<AppliedEnrichment>>,
    tuning: SearchTuning,
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        enricher: Arc<dyn Enricher>,
        tiers: TierCatalog,
        tuning: SearchTuning,
    ) -> Self {
        let embed_cache = Arc::new(QueryCache::new(tuning.embed_cache_entries));
        let enrich_cache = Arc::new(QueryCache::new(tuning.enrich_cache_entries));
        Self {
            store,
            embedder,
            enricher,
            tiers,
            embed_cache,
            enrich_cache,
            tuning,
        }
    }

    pub fn tiers(&self) -> &TierCatalog {
        &self.tiers
    }

    /// Execute one search end to end.
    pub async fn execute(&self, request: &SearchRequest) -> Result<SearchOutcome, SearchError> {
        let started = Instant::now();

        let query = Query::parse(&request.query)
            .ok_or_else(|| SearchError::InvalidQuery("query must not be empty".to_string()))?;

        let plan = self
            .tiers
            .get(&request.plan)
            .ok_or_else(|| SearchError::UnknownPlan(request.plan.clone()))?
            .clone();

        let usage = match request.usage_count {
            Some(count) => count,
            None => self
                .store
                .usage_count(&request.subscriber)
                .await
                .map_err(SearchError::SearchFailed)?,
        };

        let decision = self.tiers.resolve(&plan, usage, request.method);
        if decision.upgrade_required {
            // No search ran; the usage counter must not move.
            return Ok(SearchOutcome::UpgradeRequired(UpgradePrompt {
                upgrade_required: true,
                message: decision.upgrade_message.unwrap_or_default(),
                plan: plan.name.clone(),
                suggested_plan: plan.upgrade_to.clone(),
                queries_remaining: 0,
            }));
        }
        let method = decision.method.ok_or_else(|| {
            SearchError::SearchFailed(anyhow::anyhow!("plan '{}' permits no method", plan.name))
        })?;

        let (hits, search_type) = self.collect_hits(&query, method).await?;
        let mut results = aggregate(&hits, &self.tuning.aggregate);

        if let Some(depth) = decision.enrichment {
            self.enrich_groups(&mut results, &hits, &query, depth).await;
        }

        let new_count = self
            .store
            .increment_usage(&request.subscriber)
            .await
            .map_err(SearchError::SearchFailed)?;
        let queries_remaining = plan.monthly_limit.map(|limit| limit.saturating_sub(new_count));

        let total_books = results.len();
        let total_chapters = results.iter().map(|g| g.top_chapters.len()).sum();

        tracing::info!(
            query = %query.normalized,
            plan = %plan.name,
            search_type,
            total_books,
            "search completed in {} ms",
            started.elapsed().as_millis()
        );

        Ok(SearchOutcome::Results(SearchResponse {
            query: query.raw.clone(),
            results,
            total_books,
            total_chapters,
            search_type: search_type.to_string(),
            queries_remaining,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }))
    }

    /// Run the resolved method, falling back from vector to lexical on any
    /// degradable failure.
    async fn collect_hits(
        &self,
        query: &Query,
        method: SearchMethod,
    ) -> Result<(Vec<RawHit>, &'static str), SearchError> {
        if method == SearchMethod::Vector {
            if let Some(hits) = self.vector_hits(query).await {
                return Ok((hits, AI_VECTOR_SEARCH));
            }
        }

        let candidates = self
            .store
            .lexical_candidates(query, self.tuning.lexical_fetch_limit)
            .await
            .map_err(SearchError::SearchFailed)?;
        let hits = match_candidates(query, &candidates, self.tuning.candidate_cap);
        Ok((hits, ENHANCED_SEMANTIC_FALLBACK))
    }

    /// Vector-path hits, or `None` when the path is degraded (embedder
    /// unavailable, embedding timed out, vector index empty or erroring).
    async fn vector_hits(&self, query: &Query) -> Option<Vec<RawHit>> {
        let vector = match self.embed_cache.get(&query.normalized) {
            Some(cached) => cached,
            None => {
                let embedded = tokio::time::timeout(
                    self.tuning.embed_timeout,
                    self.embedder.embed(&query.normalized),
                )
                .await;
                match embedded {
                    Ok(Ok(vector)) => {
                        self.embed_cache
                            .put(query.normalized.clone(), vector.clone());
                        vector
                    }
                    Ok(Err(EmbedError::Unavailable(reason))) => {
                        tracing::warn!("embedding unavailable, lexical fallback: {}", reason);
                        return None;
                    }
                    Err(_) => {
                        tracing::warn!("embedding timed out, lexical fallback");
                        return None;
                    }
                }
            }
        };

        match self
            .store
            .vector_candidates(&vector, self.tuning.vector_candidates)
            .await
        {
            Ok(hits) if hits.is_empty() => {
                tracing::debug!("vector index empty, lexical fallback");
                None
            }
            Ok(hits) => Some(hits),
            Err(e) => {
                tracing::warn!("vector query failed, lexical fallback: {}", e);
                None
            }
        }
    }

    /// Enrich retained chapters with bounded fan-out. The aggregation order
    /// is already fixed; completion order only affects when fields are
    /// filled in, never where.
    async fn enrich_groups(
        &self,
        groups: &mut [BookGroup],
        hits: &[RawHit],
        query: &Query,
        depth: EnrichmentDepth,
    ) {
        let records: HashMap<i64, _> = hits
            .iter()
            .map(|h| (h.chapter.id, h.chapter.clone()))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.tuning.enrich_concurrency.max(1)));
        let mut tasks: JoinSet<(usize, usize, AppliedEnrichment)> = JoinSet::new();

        for (group_idx, group) in groups.iter().enumerate() {
            for (chapter_idx, chapter) in group.top_chapters.iter().enumerate() {
                let Some(record) = records.get(&chapter.id).cloned() else {
                    continue;
                };
                let enricher = Arc::clone(&self.enricher);
                let cache = Arc::clone(&self.enrich_cache);
                let semaphore = Arc::clone(&semaphore);
                let query = query.clone();
                let timeout = self.tuning.enrich_timeout;
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let applied =
                        enrich_chapter(enricher.as_ref(), &cache, &record, &query, depth, timeout)
                            .await;
                    (group_idx, chapter_idx, applied)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((group_idx, chapter_idx, applied)) = joined else {
                continue;
            };
            let Some(chapter) = groups
                .get_mut(group_idx)
                .and_then(|g| g.top_chapters.get_mut(chapter_idx))
            else {
                continue;
            };
            chapter.why_relevant = applied.why_relevant;
            chapter.key_topics = applied.key_topics;
            chapter.principles = applied.principles;
            chapter.applications = applied.applications;
            if let Some(score) = applied.score_override {
                chapter.relevance_score = score;
            }
            chapter.enrichment_source = applied.source;
        }
    }
}

/// Assemble the pipeline from config and an open pool. Shared by the CLI
/// and the HTTP server.
pub fn build_engine(config: &Config, pool: sqlx::SqlitePool, tuning: SearchTuning) -> SearchEngine {
    let store = Arc::new(crate::store::SqliteStore::new(pool));
    let embedder: Arc<dyn Embedder> = Arc::from(crate::embedding::create_embedder(&config.embedding));
    let enricher: Arc<dyn Enricher> = Arc::from(crate::enrich::create_enricher(&config.enrichment));
    let tiers = TierCatalog::with_overrides(&config.tiers);
    SearchEngine::new(store, embedder, enricher, tiers, tuning)
}

// ============ CLI entry point ============

/// Run one search from the CLI and print ranked results to stdout.
pub async fn run_search(
    config: &Config,
    query: &str,
    plan: &str,
    subscriber: &str,
    method: Option<SearchMethod>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;

    let mut tuning = SearchTuning::from_config(config);
    if let Some(limit) = limit {
        tuning.aggregate.max_books = limit;
    }

    let engine = build_engine(config, pool.clone(), tuning);
    let request = SearchRequest {
        query: query.to_string(),
        plan: plan.to_string(),
        subscriber: subscriber.to_string(),
        usage_count: None,
        method,
    };

    let outcome = match engine.execute(&request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            pool.close().await;
            return Err(e.into());
        }
    };
    pool.close().await;

    match outcome {
        SearchOutcome::UpgradeRequired(prompt) => {
            println!("{}", prompt.message);
            if let Some(suggested) = prompt.suggested_plan {
                println!("Suggested plan: {}", suggested);
            }
        }
        SearchOutcome::Results(response) => {
            if response.results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, group) in response.results.iter().enumerate() {
                println!(
                    "{}. [{:.1}] {} — {}",
                    i + 1,
                    group.average_relevance,
                    group.title,
                    group.author
                );
                for chapter in &group.top_chapters {
                    println!("    [{}] {}", chapter.relevance_score, chapter.title);
                    if !chapter.why_relevant.is_empty() {
                        println!("        {}", chapter.why_relevant);
                    }
                    if !chapter.key_topics.is_empty() {
                        println!("        topics: {}", chapter.key_topics.join(", "));
                    }
                }
                println!();
            }
            let remaining = match response.queries_remaining {
                Some(n) => format!("{} searches left", n),
                None => "unlimited".to_string(),
            };
            println!(
                "{} books, {} chapters · {} · {} ms · {}",
                response.total_books,
                response.total_chapters,
                response.search_type,
                response.processing_time_ms,
                remaining
            );
        }
    }

    Ok(())
}

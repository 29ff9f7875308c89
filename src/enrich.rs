//! Best-effort chapter enrichment.
//!
//! Augments a matched chapter with a natural-language relevance explanation
//! and topic tags. The primary path asks a language-model service for one
//! strict JSON object; any failure — network, non-2xx, missing credentials,
//! timeout, or a response that does not parse against the schema — degrades
//! to a deterministic keyword-overlap fallback. [`enrich_chapter`] never
//! returns an error, and a failed enrichment never aborts a search.
//!
//! Successful enrichments are cached keyed by
//! `sha256(chapter id, normalized query, depth)`; cache hits bypass both
//! paths. Fallback results are not cached — a recovered provider should get
//! the chance to replace them.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::QueryCache;
use crate::config::EnrichmentConfig;
use crate::models::{ChapterRecord, EnrichmentSource, Query};
use crate::scoring::{SCORE_CEILING, SCORE_FLOOR};
use crate::tier::EnrichmentDepth;

/// Fixed topic vocabulary for the fallback path. Topics are only emitted
/// when the term actually appears in the chapter (or the query itself).
pub const TOPIC_VOCABULARY: &[&str] = &[
    "Strategy",
    "Leadership",
    "Communication",
    "Innovation",
    "Marketing",
    "Negotiation",
    "Productivity",
    "Motivation",
    "Management",
    "Culture",
    "Teamwork",
    "Finance",
    "Entrepreneurship",
    "Growth",
    "Habits",
    "Focus",
];

const MAX_TOPICS: usize = 5;

/// Why the language-model path could not produce an enrichment.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("enrichment provider unavailable: {0}")]
    Unavailable(String),
}

/// The single JSON shape accepted from the model. No alternate field names
/// are probed; a response that does not fit is a fallback, not a guess.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentPayload {
    #[serde(default)]
    pub relevance_score: Option<f64>,
    pub why_relevant: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub principles: Option<Vec<String>>,
    #[serde(default)]
    pub practical_applications: Option<Vec<String>>,
}

/// A language-model enrichment backend.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(
        &self,
        chapter: &ChapterRecord,
        query: &Query,
        depth: EnrichmentDepth,
    ) -> Result<EnrichmentPayload, EnrichError>;
}

/// Enrichment fields as applied to a response chapter.
#[derive(Debug, Clone)]
pub struct AppliedEnrichment {
    pub why_relevant: String,
    pub key_topics: Vec<String>,
    pub principles: Option<Vec<String>>,
    pub applications: Option<Vec<String>>,
    /// Display-score override from the model, already clamped. Aggregation
    /// order and book averages are computed before enrichment and never
    /// revised by this.
    pub score_override: Option<u8>,
    pub source: EnrichmentSource,
}

// ============ Disabled Provider ============

/// Enricher that reports itself unavailable; every chapter then takes the
/// deterministic fallback.
pub struct DisabledEnricher;

#[async_trait]
impl Enricher for DisabledEnricher {
    async fn enrich(
        &self,
        _chapter: &ChapterRecord,
        _query: &Query,
        _depth: EnrichmentDepth,
    ) -> Result<EnrichmentPayload, EnrichError> {
        Err(EnrichError::Unavailable(
            "enrichment provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI-compatible Provider ============

/// Enricher backed by an OpenAI-compatible chat-completions endpoint.
///
/// One request per chapter, no retry loop: enrichment is latency-sensitive
/// and failures degrade cheaply to the fallback.
pub struct OpenAiEnricher {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEnricher {
    pub fn new(config: &EnrichmentConfig) -> Result<Self, EnrichError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EnrichError::Unavailable("enrichment.model not configured".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EnrichError::Unavailable("OPENAI_API_KEY not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EnrichError::Unavailable(e.to_string()))?;

        Ok(Self {
            model,
            api_key,
            client,
        })
    }
}

fn build_prompt(chapter: &ChapterRecord, query: &Query, depth: EnrichmentDepth) -> String {
    let excerpt = crate::aggregate::snippet(&chapter.text, 1500);
    let extra = match depth {
        EnrichmentDepth::Standard => "",
        EnrichmentDepth::Deep => {
            ", \"principles\": [2-4 core principles], \
             \"practicalApplications\": [2-4 concrete applications]"
        }
    };
    format!(
        "A reader searched for \"{}\". Explain why the following book chapter \
         is relevant.\n\nChapter: {}\n\n{}\n\nRespond with exactly one JSON \
         object: {{\"relevanceScore\": 0-100, \"whyRelevant\": \
         \"one or two sentences\", \"keyTopics\": [up to {} topics]{}}}. \
         No prose outside the JSON.",
        query.raw, chapter.title, excerpt, MAX_TOPICS, extra
    )
}

/// Strip a Markdown code fence if the model wrapped its JSON in one.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[async_trait]
impl Enricher for OpenAiEnricher {
    async fn enrich(
        &self,
        chapter: &ChapterRecord,
        query: &Query,
        depth: EnrichmentDepth,
    ) -> Result<EnrichmentPayload, EnrichError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                {
                    "role": "system",
                    "content": "You analyze business-book chapters for relevance. \
                                You reply with a single JSON object and nothing else."
                },
                { "role": "user", "content": build_prompt(chapter, query, depth) }
            ],
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EnrichError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(EnrichError::Unavailable(format!(
                "chat API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EnrichError::Unavailable(e.to_string()))?;

        let content = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| EnrichError::Unavailable("malformed chat response".to_string()))?;

        serde_json::from_str::<EnrichmentPayload>(strip_code_fence(content))
            .map_err(|e| EnrichError::Unavailable(format!("enrichment JSON did not parse: {}", e)))
    }
}

/// Create the configured [`Enricher`]. Like the embedder, a misconfigured
/// provider degrades to [`DisabledEnricher`] instead of failing startup.
pub fn create_enricher(config: &EnrichmentConfig) -> Box<dyn Enricher> {
    match config.provider.as_str() {
        "openai" => match OpenAiEnricher::new(config) {
            Ok(provider) => Box::new(provider),
            Err(e) => {
                tracing::warn!("enrichment provider unusable, using fallback only: {}", e);
                Box::new(DisabledEnricher)
            }
        },
        "disabled" => Box::new(DisabledEnricher),
        other => {
            tracing::warn!("unknown enrichment provider '{}', using fallback only", other);
            Box::new(DisabledEnricher)
        }
    }
}

// ============ Entry point ============

/// Canonical enrichment-cache key.
pub fn enrichment_key(chapter_id: i64, query: &Query, depth: EnrichmentDepth) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chapter_id.to_le_bytes());
    hasher.update([0x1f]);
    hasher.update(query.normalized.as_bytes());
    hasher.update([0x1f]);
    hasher.update(depth.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Enrich one chapter. Infallible: cache hit, provider result, or the
/// deterministic fallback — in that order.
pub async fn enrich_chapter(
    enricher: &dyn Enricher,
    cache: &QueryCache<AppliedEnrichment>,
    chapter: &ChapterRecord,
    query: &Query,
    depth: EnrichmentDepth,
    timeout: Duration,
) -> AppliedEnrichment {
    let key = enrichment_key(chapter.id, query, depth);
    if let Some(mut cached) = cache.get(&key) {
        cached.source = EnrichmentSource::Cached;
        return cached;
    }

    match tokio::time::timeout(timeout, enricher.enrich(chapter, query, depth)).await {
        Ok(Ok(payload)) => {
            let applied = apply_payload(payload, chapter, query, depth);
            cache.put(key, applied.clone());
            applied
        }
        Ok(Err(e)) => {
            tracing::debug!(chapter = chapter.id, "enrichment degraded: {}", e);
            fallback_enrichment(chapter, query)
        }
        Err(_) => {
            tracing::debug!(chapter = chapter.id, "enrichment timed out");
            fallback_enrichment(chapter, query)
        }
    }
}

/// Clamp and default a parsed payload into applicable fields.
fn apply_payload(
    payload: EnrichmentPayload,
    chapter: &ChapterRecord,
    query: &Query,
    depth: EnrichmentDepth,
) -> AppliedEnrichment {
    let fallback = fallback_enrichment(chapter, query);

    let why_relevant = {
        let trimmed = payload.why_relevant.trim();
        if trimmed.is_empty() {
            fallback.why_relevant.clone()
        } else {
            trimmed.to_string()
        }
    };

    let mut key_topics: Vec<String> = payload
        .key_topics
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .take(MAX_TOPICS)
        .collect();
    if key_topics.is_empty() {
        key_topics = fallback.key_topics.clone();
    }

    let score_override = payload
        .relevance_score
        .filter(|s| s.is_finite())
        .map(|s| (s.round() as i32).clamp(SCORE_FLOOR as i32, SCORE_CEILING as i32) as u8);

    let (principles, applications) = match depth {
        EnrichmentDepth::Standard => (None, None),
        EnrichmentDepth::Deep => (
            payload.principles.filter(|p| !p.is_empty()),
            payload.practical_applications.filter(|a| !a.is_empty()),
        ),
    };

    AppliedEnrichment {
        why_relevant,
        key_topics,
        principles,
        applications,
        score_override,
        source: EnrichmentSource::Ai,
    }
}

/// Deterministic enrichment from keyword overlap and the fixed vocabulary.
pub fn fallback_enrichment(chapter: &ChapterRecord, query: &Query) -> AppliedEnrichment {
    let text = chapter.text.to_lowercase();
    let title = chapter.title.to_lowercase();

    let overlap: Vec<&str> = query
        .words()
        .iter()
        .filter(|w| text.contains(w.as_str()) || title.contains(w.as_str()))
        .map(|w| w.as_str())
        .collect();

    let why_relevant = if overlap.is_empty() {
        format!(
            "Selected for thematic similarity to \"{}\" within this book.",
            query.raw
        )
    } else {
        format!(
            "This chapter directly discusses {}, matching your search for \"{}\".",
            overlap.join(", "),
            query.raw
        )
    };

    let key_topics: Vec<String> = TOPIC_VOCABULARY
        .iter()
        .filter(|topic| {
            let needle = topic.to_lowercase();
            text.contains(&needle) || title.contains(&needle) || query.normalized.contains(&needle)
        })
        .take(MAX_TOPICS)
        .map(|t| t.to_string())
        .collect();

    AppliedEnrichment {
        why_relevant,
        key_topics,
        principles: None,
        applications: None,
        score_override: None,
        source: EnrichmentSource::Heuristic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chapter() -> ChapterRecord {
        ChapterRecord {
            id: 7,
            book_id: 1,
            title: "Leading Through Change".to_string(),
            text: "Leadership under pressure demands clear communication and \
                   a strategy everyone understands."
                .to_string(),
        }
    }

    struct CountingEnricher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Enricher for CountingEnricher {
        async fn enrich(
            &self,
            _chapter: &ChapterRecord,
            _query: &Query,
            _depth: EnrichmentDepth,
        ) -> Result<EnrichmentPayload, EnrichError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EnrichError::Unavailable("simulated outage".into()))
            } else {
                Ok(EnrichmentPayload {
                    relevance_score: Some(150.0),
                    why_relevant: "Covers the topic end to end.".to_string(),
                    key_topics: vec!["Change".to_string()],
                    principles: Some(vec!["Name the stakes".to_string()]),
                    practical_applications: None,
                })
            }
        }
    }

    #[test]
    fn test_fallback_topics_from_vocabulary_and_text() {
        let q = Query::parse("leadership").unwrap();
        let applied = fallback_enrichment(&chapter(), &q);
        assert!(!applied.key_topics.is_empty());
        for topic in &applied.key_topics {
            assert!(TOPIC_VOCABULARY.contains(&topic.as_str()));
            assert!(chapter()
                .text
                .to_lowercase()
                .contains(&topic.to_lowercase()));
        }
        assert_eq!(applied.source, EnrichmentSource::Heuristic);
        assert!(applied.why_relevant.contains("leadership"));
    }

    #[tokio::test]
    async fn test_provider_failure_degrades_to_fallback() {
        let enricher = CountingEnricher {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let cache = QueryCache::new(8);
        let q = Query::parse("leadership").unwrap();
        let applied = enrich_chapter(
            &enricher,
            &cache,
            &chapter(),
            &q,
            EnrichmentDepth::Standard,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(applied.source, EnrichmentSource::Heuristic);
        assert!(!applied.key_topics.is_empty());
        // Failures are not cached.
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_provider() {
        let enricher = CountingEnricher {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let cache = QueryCache::new(8);
        let q = Query::parse("leadership").unwrap();

        let first = enrich_chapter(
            &enricher,
            &cache,
            &chapter(),
            &q,
            EnrichmentDepth::Deep,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(first.source, EnrichmentSource::Ai);
        // 150 from the model clamps to the ceiling.
        assert_eq!(first.score_override, Some(100));

        let second = enrich_chapter(
            &enricher,
            &cache,
            &chapter(),
            &q,
            EnrichmentDepth::Deep,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(second.source, EnrichmentSource::Cached);
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_standard_depth_drops_deep_fields() {
        let enricher = CountingEnricher {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let cache = QueryCache::new(8);
        let q = Query::parse("change").unwrap();
        let applied = enrich_chapter(
            &enricher,
            &cache,
            &chapter(),
            &q,
            EnrichmentDepth::Standard,
            Duration::from_secs(5),
        )
        .await;
        assert!(applied.principles.is_none());
        assert!(applied.applications.is_none());
    }

    #[test]
    fn test_cache_keys_distinguish_query_and_depth() {
        let q1 = Query::parse("leadership").unwrap();
        let q2 = Query::parse("strategy").unwrap();
        assert_ne!(
            enrichment_key(1, &q1, EnrichmentDepth::Standard),
            enrichment_key(1, &q2, EnrichmentDepth::Standard)
        );
        assert_ne!(
            enrichment_key(1, &q1, EnrichmentDepth::Standard),
            enrichment_key(1, &q1, EnrichmentDepth::Deep)
        );
        assert_ne!(
            enrichment_key(1, &q1, EnrichmentDepth::Standard),
            enrichment_key(2, &q1, EnrichmentDepth::Standard)
        );
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn test_payload_clamping_and_defaults() {
        let q = Query::parse("focus").unwrap();
        let payload = EnrichmentPayload {
            relevance_score: Some(3.0),
            why_relevant: "   ".to_string(),
            key_topics: vec!["  ".to_string()],
            principles: Some(vec![]),
            practical_applications: None,
        };
        let applied = apply_payload(payload, &chapter(), &q, EnrichmentDepth::Deep);
        // Sub-floor score clamps up; blank fields fall back.
        assert_eq!(applied.score_override, Some(25));
        assert!(!applied.why_relevant.trim().is_empty());
        assert!(applied.principles.is_none());
    }
}

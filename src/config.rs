use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::tier::TierDefinition;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Plan overrides merged over the built-in tier catalog.
    #[serde(default)]
    pub tiers: BTreeMap<String, TierDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Chapters retained per book in a result group.
    #[serde(default = "default_k_per_book")]
    pub k_per_book: usize,
    /// Books retained in a response.
    #[serde(default = "default_max_books")]
    pub max_books: usize,
    /// Noise floor on book-average scores.
    #[serde(default = "default_min_avg_score")]
    pub min_avg_score: u8,
    /// Hits handed to the scorer from the lexical matcher.
    #[serde(default = "default_candidate_cap")]
    pub candidate_cap: usize,
    /// Rows fetched per substring pattern before precise classification.
    #[serde(default = "default_lexical_fetch_limit")]
    pub lexical_fetch_limit: i64,
    /// Hits taken from the vector index before aggregation.
    #[serde(default = "default_vector_candidates")]
    pub vector_candidates: i64,
    /// Snippet length in characters.
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k_per_book: default_k_per_book(),
            max_books: default_max_books(),
            min_avg_score: default_min_avg_score(),
            candidate_cap: default_candidate_cap(),
            lexical_fetch_limit: default_lexical_fetch_limit(),
            vector_candidates: default_vector_candidates(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_k_per_book() -> usize {
    3
}
fn default_max_books() -> usize {
    12
}
fn default_min_avg_score() -> u8 {
    10
}
fn default_candidate_cap() -> usize {
    20
}
fn default_lexical_fetch_limit() -> i64 {
    200
}
fn default_vector_candidates() -> i64 {
    40
}
fn default_snippet_chars() -> usize {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    /// Query-embedding cache capacity; 0 disables the cache.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            max_retries: 5,
            timeout_secs: 30,
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_enrich_timeout_secs")]
    pub timeout_secs: u64,
    /// Bound on concurrent per-chapter enrichment calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Enrichment cache capacity; 0 disables the cache.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            timeout_secs: default_enrich_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_enrich_timeout_secs() -> u64 {
    20
}
fn default_max_concurrency() -> usize {
    4
}
fn default_cache_max_entries() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl EnrichmentConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.search.k_per_book == 0 {
        anyhow::bail!("search.k_per_book must be >= 1");
    }
    if config.search.max_books == 0 {
        anyhow::bail!("search.max_books must be >= 1");
    }
    if config.search.min_avg_score > 100 {
        anyhow::bail!("search.min_avg_score must be in [0, 100]");
    }
    if config.search.snippet_chars == 0 {
        anyhow::bail!("search.snippet_chars must be >= 1");
    }
    if config.enrichment.max_concurrency == 0 {
        anyhow::bail!("enrichment.max_concurrency must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.enrichment.is_enabled() && config.enrichment.model.is_none() {
        anyhow::bail!(
            "enrichment.model must be specified when provider is '{}'",
            config.enrichment.provider
        );
    }
    match config.enrichment.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown enrichment provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    for (name, tier) in &config.tiers {
        if tier.methods.is_empty() {
            anyhow::bail!("tiers.{}.methods must not be empty", name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse("[db]\npath = \"data/shelf.sqlite\"\n").unwrap();
        assert_eq!(config.search.k_per_book, 3);
        assert_eq!(config.search.max_books, 12);
        assert_eq!(config.search.min_avg_score, 10);
        assert!(!config.embedding.is_enabled());
        assert!(!config.enrichment.is_enabled());
        assert_eq!(config.server.bind, "127.0.0.1:7878");
        assert!(config.tiers.is_empty());
    }

    #[test]
    fn test_embedding_requires_model_and_dims() {
        let err = parse(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\n",
        );
        assert!(err.is_err());

        let ok = parse(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\n\
             model = \"text-embedding-3-small\"\ndims = 1536\n",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_rejects_zero_k_per_book() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[search]\nk_per_book = 0\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"llama\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_tier_override_parses() {
        let config = parse(
            r#"
            [db]
            path = "x.sqlite"

            [tiers.free]
            name = "free"
            monthly_limit = 3
            methods = ["lexical"]

            [tiers.free.features]
            vector_search = false
            "#,
        )
        .unwrap();
        let free = config.tiers.get("free").unwrap();
        assert_eq!(free.monthly_limit, Some(3));
        assert_eq!(free.features.get("vector_search"), Some(&false));
    }

    #[test]
    fn test_tier_override_rejects_empty_methods() {
        let err = parse(
            r#"
            [db]
            path = "x.sqlite"

            [tiers.broken]
            name = "broken"
            methods = []
            "#,
        );
        assert!(err.is_err());
    }
}

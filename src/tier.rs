//! Subscription tiers and search-method selection.
//!
//! Each plan carries a monthly query allowance, an ordered list of
//! permitted search methods (best first), an enrichment depth, and a
//! declarative feature table. The feature table is exposed verbatim to
//! callers for UI gating; the search core interprets nothing beyond the
//! method and enrichment decision.
//!
//! Resolution is a single decision per request, not a state machine: the
//! allowance is checked first, and an exhausted finite allowance yields an
//! upgrade prompt with no method — the orchestrator must not run any search
//! in that case.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::FeatureTable;

/// An underlying search strategy, selected once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    /// Embedding-based vector matching.
    Vector,
    /// Substring/keyword matching.
    Lexical,
}

impl SearchMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" => Some(Self::Vector),
            "lexical" => Some(Self::Lexical),
            _ => None,
        }
    }
}

/// How deep chapter enrichment goes for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentDepth {
    /// Explanation and key topics.
    Standard,
    /// Standard plus principles and practical applications.
    Deep,
}

impl EnrichmentDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }
}

/// One subscription plan. Effectively static configuration, loaded at
/// startup and never mutated per-request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDefinition {
    /// Filled from the catalog key when loaded from config.
    #[serde(default)]
    pub name: String,
    /// Monthly query allowance; `None` means unlimited.
    pub monthly_limit: Option<u32>,
    /// Permitted methods, best first.
    pub methods: Vec<SearchMethod>,
    /// Enrichment depth; `None` disables enrichment for the plan.
    #[serde(default)]
    pub enrichment: Option<EnrichmentDepth>,
    /// Plan suggested in upgrade prompts.
    #[serde(default)]
    pub upgrade_to: Option<String>,
    #[serde(default)]
    pub features: FeatureTable,
}

/// The outcome of tier resolution for one request.
#[derive(Debug, Clone)]
pub struct MethodDecision {
    /// Selected method; `None` exactly when `upgrade_required`.
    pub method: Option<SearchMethod>,
    pub enrichment: Option<EnrichmentDepth>,
    /// Allowance left including the current request; `None` for unlimited.
    pub queries_remaining: Option<u32>,
    pub upgrade_required: bool,
    pub upgrade_message: Option<String>,
}

/// All known plans, keyed by plan name.
#[derive(Debug, Clone)]
pub struct TierCatalog {
    plans: BTreeMap<String, TierDefinition>,
}

fn features(pairs: &[(&str, bool)]) -> FeatureTable {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect()
}

impl Default for TierCatalog {
    fn default() -> Self {
        let mut plans = BTreeMap::new();

        plans.insert(
            "free".to_string(),
            TierDefinition {
                name: "free".to_string(),
                monthly_limit: Some(10),
                methods: vec![SearchMethod::Lexical],
                enrichment: None,
                upgrade_to: Some("scholar".to_string()),
                features: features(&[
                    ("vector_search", false),
                    ("ai_analysis", false),
                    ("full_text_access", false),
                    ("export_reports", false),
                ]),
            },
        );
        plans.insert(
            "scholar".to_string(),
            TierDefinition {
                name: "scholar".to_string(),
                monthly_limit: Some(100),
                methods: vec![SearchMethod::Vector, SearchMethod::Lexical],
                enrichment: Some(EnrichmentDepth::Standard),
                upgrade_to: Some("professional".to_string()),
                features: features(&[
                    ("vector_search", true),
                    ("ai_analysis", true),
                    ("full_text_access", false),
                    ("export_reports", false),
                ]),
            },
        );
        plans.insert(
            "professional".to_string(),
            TierDefinition {
                name: "professional".to_string(),
                monthly_limit: Some(500),
                methods: vec![SearchMethod::Vector, SearchMethod::Lexical],
                enrichment: Some(EnrichmentDepth::Deep),
                upgrade_to: Some("institution".to_string()),
                features: features(&[
                    ("vector_search", true),
                    ("ai_analysis", true),
                    ("full_text_access", true),
                    ("export_reports", true),
                ]),
            },
        );
        plans.insert(
            "institution".to_string(),
            TierDefinition {
                name: "institution".to_string(),
                monthly_limit: None,
                methods: vec![SearchMethod::Vector, SearchMethod::Lexical],
                enrichment: Some(EnrichmentDepth::Deep),
                upgrade_to: None,
                features: features(&[
                    ("vector_search", true),
                    ("ai_analysis", true),
                    ("full_text_access", true),
                    ("export_reports", true),
                    ("team_seats", true),
                ]),
            },
        );

        Self { plans }
    }
}

impl TierCatalog {
    /// Built-in plans with config overrides merged on top. An override with
    /// a new name adds a plan; an override with a known name replaces it.
    pub fn with_overrides(overrides: &BTreeMap<String, TierDefinition>) -> Self {
        let mut catalog = Self::default();
        for (name, def) in overrides {
            let mut def = def.clone();
            def.name = name.clone();
            catalog.plans.insert(name.clone(), def);
        }
        catalog
    }

    pub fn get(&self, name: &str) -> Option<&TierDefinition> {
        self.plans.get(name)
    }

    pub fn plans(&self) -> impl Iterator<Item = &TierDefinition> {
        self.plans.values()
    }

    /// Resolve the method for one request.
    ///
    /// The allowance is evaluated before anything else. Otherwise the
    /// caller's requested method is honored when the plan permits it;
    /// the plan's first listed method is the default.
    pub fn resolve(
        &self,
        plan: &TierDefinition,
        usage_count: u32,
        requested: Option<SearchMethod>,
    ) -> MethodDecision {
        if let Some(limit) = plan.monthly_limit {
            if usage_count >= limit {
                let message = format!(
                    "You've used all {} searches included in the {} plan this month. \
                     Upgrade to keep searching.",
                    limit, plan.name
                );
                return MethodDecision {
                    method: None,
                    enrichment: None,
                    queries_remaining: Some(0),
                    upgrade_required: true,
                    upgrade_message: Some(message),
                };
            }
        }

        let method = requested
            .filter(|m| plan.methods.contains(m))
            .or_else(|| plan.methods.first().copied());

        MethodDecision {
            method,
            enrichment: plan.enrichment,
            queries_remaining: plan.monthly_limit.map(|limit| limit - usage_count),
            upgrade_required: false,
            upgrade_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_plans() {
        let catalog = TierCatalog::default();
        for name in ["free", "scholar", "professional", "institution"] {
            assert!(catalog.get(name).is_some(), "missing plan {}", name);
        }
        assert_eq!(catalog.get("free").unwrap().monthly_limit, Some(10));
        assert_eq!(catalog.get("institution").unwrap().monthly_limit, None);
    }

    #[test]
    fn test_free_tier_is_lexical_only() {
        let catalog = TierCatalog::default();
        let free = catalog.get("free").unwrap();
        let decision = catalog.resolve(free, 0, None);
        assert!(!decision.upgrade_required);
        assert_eq!(decision.method, Some(SearchMethod::Lexical));
        assert_eq!(decision.enrichment, None);
        assert_eq!(decision.queries_remaining, Some(10));
    }

    #[test]
    fn test_exhausted_allowance_requires_upgrade() {
        let catalog = TierCatalog::default();
        let free = catalog.get("free").unwrap();
        let decision = catalog.resolve(free, 10, None);
        assert!(decision.upgrade_required);
        assert!(decision.method.is_none());
        assert_eq!(decision.queries_remaining, Some(0));
        assert!(decision.upgrade_message.unwrap().contains("10"));
    }

    #[test]
    fn test_over_limit_also_requires_upgrade() {
        let catalog = TierCatalog::default();
        let free = catalog.get("free").unwrap();
        assert!(catalog.resolve(free, 37, None).upgrade_required);
    }

    #[test]
    fn test_unlimited_plan_never_exhausts() {
        let catalog = TierCatalog::default();
        let inst = catalog.get("institution").unwrap();
        let decision = catalog.resolve(inst, 1_000_000, None);
        assert!(!decision.upgrade_required);
        assert_eq!(decision.method, Some(SearchMethod::Vector));
        assert_eq!(decision.queries_remaining, None);
    }

    #[test]
    fn test_scholar_defaults_to_vector() {
        let catalog = TierCatalog::default();
        let scholar = catalog.get("scholar").unwrap();
        let decision = catalog.resolve(scholar, 5, None);
        assert_eq!(decision.method, Some(SearchMethod::Vector));
        assert_eq!(decision.enrichment, Some(EnrichmentDepth::Standard));
        assert_eq!(decision.queries_remaining, Some(95));
    }

    #[test]
    fn test_requested_method_honored_when_permitted() {
        let catalog = TierCatalog::default();
        let scholar = catalog.get("scholar").unwrap();
        let decision = catalog.resolve(scholar, 0, Some(SearchMethod::Lexical));
        assert_eq!(decision.method, Some(SearchMethod::Lexical));
    }

    #[test]
    fn test_disallowed_request_falls_back_to_plan_default() {
        let catalog = TierCatalog::default();
        let free = catalog.get("free").unwrap();
        let decision = catalog.resolve(free, 0, Some(SearchMethod::Vector));
        assert_eq!(decision.method, Some(SearchMethod::Lexical));
    }

    #[test]
    fn test_overrides_replace_and_extend() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "free".to_string(),
            TierDefinition {
                name: String::new(),
                monthly_limit: Some(3),
                methods: vec![SearchMethod::Lexical],
                enrichment: None,
                upgrade_to: None,
                features: FeatureTable::new(),
            },
        );
        let catalog = TierCatalog::with_overrides(&overrides);
        assert_eq!(catalog.get("free").unwrap().monthly_limit, Some(3));
        assert_eq!(catalog.get("free").unwrap().name, "free");
        assert!(catalog.get("scholar").is_some());
    }
}

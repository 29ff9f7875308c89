use thiserror::Error;

/// Errors surfaced by the search pipeline.
///
/// An exhausted allowance is not an error — it is a normal terminal outcome
/// carried by `SearchOutcome::UpgradeRequired`. Degradable infrastructure
/// failures (embedding provider down, enrichment provider down, empty vector
/// index) never reach this type; they are resolved inside the owning
/// component via the documented fallback paths.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The query was empty or otherwise unusable. Surfaced directly, no retry.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The request named a plan the tier catalog does not know.
    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    /// The storage layer failed. Fatal: there is no alternative data source.
    #[error("search failed: {0}")]
    SearchFailed(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SearchError>;

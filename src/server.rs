//! HTTP API for the web frontend.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | Execute a search for a plan/subscriber |
//! | `GET`  | `/tiers` | Tier catalog with feature tables, for UI gating |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Error responses carry a machine-readable code and a human message:
//!
//! ```json
//! { "error": { "code": "invalid_query", "message": "query must not be empty" } }
//! ```
//!
//! Codes: `invalid_query` (400), `unknown_plan` (400), `search_failed` (500).
//! An exhausted allowance is not an error: it returns `200` with
//! `upgradeRequired: true` and no results, so the frontend renders the
//! upgrade call-to-action from a normal payload.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted: the consumer is a
//! browser application served from a different origin.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::SearchError;
use crate::models::FeatureTable;
use crate::search::{build_engine, SearchEngine, SearchOutcome, SearchRequest, SearchTuning};
use crate::tier::SearchMethod;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<SearchEngine>,
}

/// Start the HTTP server. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let engine = Arc::new(build_engine(
        config,
        pool,
        SearchTuning::from_config(config),
    ));

    let state = AppState { engine };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/search", post(handle_search))
        .route("/tiers", get(handle_tiers))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("Shelf Search API listening on http://{}", config.server.bind);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::InvalidQuery(_) => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "invalid_query",
                message: err.to_string(),
            },
            SearchError::UnknownPlan(_) => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "unknown_plan",
                message: err.to_string(),
            },
            SearchError::SearchFailed(_) => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "search_failed",
                message: "search failed, please retry".to_string(),
            },
        }
    }
}

// ============ POST /search ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    query: String,
    plan: String,
    #[serde(default)]
    subscriber: Option<String>,
    #[serde(default)]
    usage_count: Option<u32>,
    #[serde(default)]
    method: Option<SearchMethod>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = SearchRequest {
        query: body.query,
        plan: body.plan,
        subscriber: body.subscriber.unwrap_or_else(|| "anonymous".to_string()),
        usage_count: body.usage_count,
        method: body.method,
    };

    let outcome = state.engine.execute(&request).await?;

    let value = match outcome {
        SearchOutcome::Results(response) => {
            serde_json::to_value(&response).map_err(|e| AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "search_failed",
                message: e.to_string(),
            })?
        }
        SearchOutcome::UpgradeRequired(prompt) => {
            serde_json::to_value(&prompt).map_err(|e| AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "search_failed",
                message: e.to_string(),
            })?
        }
    };

    Ok(Json(value))
}

// ============ GET /tiers ============

/// One plan as exposed to the frontend.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TierInfo {
    name: String,
    /// `null` for unlimited plans.
    monthly_limit: Option<u32>,
    methods: Vec<SearchMethod>,
    enrichment: Option<String>,
    features: FeatureTable,
}

#[derive(Serialize)]
struct TierListResponse {
    tiers: Vec<TierInfo>,
}

async fn handle_tiers(State(state): State<AppState>) -> Json<TierListResponse> {
    let tiers = state
        .engine
        .tiers()
        .plans()
        .map(|plan| TierInfo {
            name: plan.name.clone(),
            monthly_limit: plan.monthly_limit,
            methods: plan.methods.clone(),
            enrichment: plan.enrichment.map(|d| d.as_str().to_string()),
            features: plan.features.clone(),
        })
        .collect();

    Json(TierListResponse { tiers })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

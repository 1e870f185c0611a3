use crate::config::Config;
use crate::db::Db;
use crate::embeddings::EmbedderHandle;
use crate::ingest::JobRunner;
use crate::query::QueryEngine;
use axum::routing::{get, patch, post, put};
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod agents;
pub mod ask;
pub mod connectors;
pub mod guard_rails;
pub mod jobs;
pub mod knowledge_bases;
pub mod types;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub embedder: Arc<EmbedderHandle>,
    pub engine: Arc<QueryEngine>,
    pub jobs: Arc<JobRunner>,
    pub config: Arc<Config>,
}

/// Build the axum router for the full API surface.
pub fn create_router(state: AppState) -> Router {
    // Explicit origin list when configured; Any for local development
    let allowed_origins = &state.config.http_server.allowed_origins;
    let cors = if allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/knowledge-base/",
            post(knowledge_bases::create).get(knowledge_bases::list),
        )
        .route("/knowledge-base/:kb", get(knowledge_bases::get_one))
        .route("/knowledge-base/:kb/jobs", post(jobs::create))
        .route(
            "/knowledge-base/:kb/jobs/:job_id",
            put(jobs::populate).get(jobs::status).delete(jobs::cancel),
        )
        .route("/knowledge-base/:kb/jobs/:job_id/trigger", post(jobs::trigger))
        .route(
            "/connectors/local/s3-upload-links",
            get(connectors::upload_links),
        )
        .route("/connectors/local/uploads/:token", put(connectors::upload))
        .route(
            "/users/guard-rails",
            post(guard_rails::create).get(guard_rails::list),
        )
        .route("/ask/templates", post(agents::create_template))
        .route(
            "/users/agents/execution-layers",
            post(agents::create_execution_layer),
        )
        .route("/users/agents", post(agents::create_agent))
        .route("/users/agents/:agent_id", patch(agents::patch_agent))
        .route("/ask/query", post(ask::query))
        .route("/ask/agents/:agent_id/query", post(ask::agent_query))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Health check endpoint
async fn handle_health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "service": "kbserve",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

use super::types::AskParams;
use super::AppState;
use crate::error::{KbServeError, Result};
use crate::query::QueryResponse;
use axum::extract::{Path, Query, State};
use axum::Json;

/// `POST /ask/query?kb=&q=...` — query a knowledge base directly.
pub async fn query(
    State(state): State<AppState>,
    Query(params): Query<AskParams>,
) -> Result<Json<QueryResponse>> {
    let kb_id = params.kb.as_deref().ok_or_else(|| {
        KbServeError::InvalidInput("Query parameter kb is required".to_string())
    })?;
    let response = state
        .engine
        .ask_knowledge_base(kb_id, &params.q, params.to_options())
        .await?;
    Ok(Json(response))
}

/// `POST /ask/agents/{agentId}/query?q=...` — query through an agent.
pub async fn agent_query(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(params): Query<AskParams>,
) -> Result<Json<QueryResponse>> {
    let response = state
        .engine
        .ask_agent(&agent_id, &params.q, params.to_options())
        .await?;
    Ok(Json(response))
}

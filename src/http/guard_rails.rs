use super::types::CreateGuardRailRequest;
use super::AppState;
use crate::error::Result;
use crate::guardrail::{self, GuardRail};
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

/// `POST /users/guard-rails`
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateGuardRailRequest>,
) -> Result<(StatusCode, Json<GuardRail>)> {
    let config = &body.source_fabric.config;
    let rail = guardrail::create_guard_rail(
        &state.db,
        &body.name,
        body.description.as_deref(),
        &config.knowledge_base,
        config.similarity_threshold,
        &config.level,
        config.message.as_deref(),
        body.response_blocking,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(rail)))
}

/// `GET /users/guard-rails`
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<GuardRail>>> {
    Ok(Json(guardrail::list_guard_rails(&state.db).await?))
}

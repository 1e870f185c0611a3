use super::types::{CreateAgentRequest, CreateExecutionLayerRequest, CreateTemplateRequest};
use super::AppState;
use crate::agent::{self, Agent, AgentPatch, ExecutionLayer, Template};
use crate::error::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

/// `POST /ask/templates`
pub async fn create_template(
    State(state): State<AppState>,
    Json(body): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<Template>)> {
    let template = agent::create_template(&state.db, &body.name, &body.content).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

/// `POST /users/agents/execution-layers`
pub async fn create_execution_layer(
    State(state): State<AppState>,
    Json(body): Json<CreateExecutionLayerRequest>,
) -> Result<(StatusCode, Json<ExecutionLayer>)> {
    let layer = agent::create_execution_layer(
        &state.db,
        &body.name,
        body.description.as_deref(),
        body.kind,
        body.config,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(layer)))
}

/// `POST /users/agents`
pub async fn create_agent(
    State(state): State<AppState>,
    Json(body): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<Agent>)> {
    let agent = agent::create_agent(
        &state.db,
        &body.name,
        body.template_id.as_deref(),
        &body.execution_layers,
        &body.guard_rails,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// `PATCH /users/agents/{agentId}` — replace attached guardrails,
/// execution layers and/or template.
pub async fn patch_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(patch): Json<AgentPatch>,
) -> Result<Json<Agent>> {
    let agent = agent::update_agent(&state.db, &agent_id, patch).await?;
    Ok(Json(agent))
}

use super::types::CreateKnowledgeBaseRequest;
use super::AppState;
use crate::error::Result;
use crate::registry::{self, KbType, KnowledgeBase, ParagraphConfig};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

/// `POST /knowledge-base/`
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateKnowledgeBaseRequest>,
) -> Result<(StatusCode, Json<KnowledgeBase>)> {
    let kb_type = KbType::parse(&body.kb_type)?;
    let paragraphs = body.paragraphs.unwrap_or(ParagraphConfig {
        chunk_size: state.config.chunking.default_chunk_size,
        chunk_overlap: state.config.chunking.default_chunk_overlap,
    });

    let kb = registry::create_knowledge_base(&state.db, &body.name, kb_type, paragraphs).await?;
    Ok((StatusCode::CREATED, Json(kb)))
}

/// `GET /knowledge-base/`
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<KnowledgeBase>>> {
    Ok(Json(registry::list_knowledge_bases(&state.db).await?))
}

/// `GET /knowledge-base/{kb}`
pub async fn get_one(
    State(state): State<AppState>,
    Path(kb_id): Path<String>,
) -> Result<Json<KnowledgeBase>> {
    Ok(Json(registry::get_knowledge_base(&state.db, &kb_id).await?))
}

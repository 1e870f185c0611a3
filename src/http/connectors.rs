use super::types::UploadLinkParams;
use super::AppState;
use crate::connectors;
use crate::error::Result;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use std::collections::HashMap;

/// `GET /connectors/local/s3-upload-links?kb=&fileName=`
///
/// Returns `{<fileName>: uploadUri}`.
pub async fn upload_links(
    State(state): State<AppState>,
    Query(params): Query<UploadLinkParams>,
) -> Result<Json<HashMap<String, String>>> {
    let links = connectors::create_upload_link(&state.db, &params.kb, &params.file_name).await?;
    Ok(Json(links))
}

/// `PUT /connectors/local/uploads/{token}`
///
/// Accepts the raw file bytes; the Content-Type header is recorded as
/// the document's MIME type for extraction.
pub async fn upload(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let content_type = headers
        .get("content-type")
        .and_then(|h| h.to_str().ok())
        .map(String::from);

    connectors::store_upload(
        &state.db,
        state.config.upload_dir(),
        &token,
        content_type,
        body.to_vec(),
    )
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

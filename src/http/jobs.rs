use super::AppState;
use crate::error::Result;
use crate::ingest::jobs::{self, IngestionJob, JobFileSpec};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

/// `POST /knowledge-base/{kb}/jobs`
pub async fn create(
    State(state): State<AppState>,
    Path(kb_id): Path<String>,
) -> Result<(StatusCode, Json<IngestionJob>)> {
    let job = jobs::create_job(&state.db, &kb_id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// `PUT /knowledge-base/{kb}/jobs/{jobId}` — submit the file list.
pub async fn populate(
    State(state): State<AppState>,
    Path((kb_id, job_id)): Path<(String, String)>,
    Json(files): Json<Vec<JobFileSpec>>,
) -> Result<Json<IngestionJob>> {
    let job = jobs::populate_job(&state.db, &kb_id, &job_id, files).await?;
    Ok(Json(job))
}

/// `POST /knowledge-base/{kb}/jobs/{jobId}/trigger` — begin processing.
pub async fn trigger(
    State(state): State<AppState>,
    Path((kb_id, job_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<IngestionJob>)> {
    let job = state.jobs.trigger(&kb_id, &job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// `GET /knowledge-base/{kb}/jobs/{jobId}` — job and per-file status.
pub async fn status(
    State(state): State<AppState>,
    Path((kb_id, job_id)): Path<(String, String)>,
) -> Result<Json<IngestionJob>> {
    let job = jobs::get_job(&state.db, &kb_id, &job_id).await?;
    Ok(Json(job))
}

/// `DELETE /knowledge-base/{kb}/jobs/{jobId}` — cancel a job.
pub async fn cancel(
    State(state): State<AppState>,
    Path((kb_id, job_id)): Path<(String, String)>,
) -> Result<Json<IngestionJob>> {
    let job = state.jobs.cancel(&kb_id, &job_id).await?;
    Ok(Json(job))
}

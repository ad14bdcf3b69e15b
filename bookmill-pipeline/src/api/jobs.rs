//! Job endpoints
//!
//! POST /books/:label/jobs, GET /books/:label/jobs, GET /jobs/:id

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bookmill_common::ids::validate_label;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    jobs::Job,
    AppState,
};

/// POST /books/:label/jobs request
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub params: Value,
}

/// POST /books/:label/jobs response
#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}

/// POST /books/:label/jobs
///
/// Returns 202 Accepted with the job id; the job runs in the background.
pub async fn enqueue_job(
    State(state): State<AppState>,
    Path(label): Path<String>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    validate_label(&label)?;
    if !state.queue.has_executor(&request.job_type) {
        return Err(ApiError::BadRequest(format!(
            "Unknown job type: {}",
            request.job_type
        )));
    }
    // Fails fast for unknown or deleted books
    state.books.open(&label).await?;

    let job_id = state.queue.enqueue(&request.job_type, &label, request.params);
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    state
        .queue
        .get_job(job_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {}", job_id)))
}

/// GET /books/:label/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> ApiResult<Json<Vec<Job>>> {
    validate_label(&label)?;
    Ok(Json(state.queue.list_jobs(&label)))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/books/:label/jobs", post(enqueue_job).get(list_jobs))
        .route("/jobs/:id", get(get_job))
}

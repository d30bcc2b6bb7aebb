//! Job submission, query and cancellation.

use crate::AppState;
use crate::auth::require_token;
use crate::error::ApiError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use buildit_core::{Job, JobId};
use buildit_scheduler::Submitted;
use serde::{Deserialize, Serialize};

pub fn router(state: AppState) -> Router<AppState> {
    let mutating = Router::new()
        .route("/", post(submit_job))
        .route("/batch", post(submit_batch))
        .route("/{id}/cancel", post(cancel_job))
        .route_layer(middleware::from_fn_with_state(state, require_token));

    Router::new().route("/{id}", get(get_job)).merge(mutating)
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub target: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

/// Targets may name groups; they are expanded server-side.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub targets: Vec<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub jobs: Vec<Submitted>,
}

fn parse_id(id: &str) -> Result<JobId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id: {}", id)))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job_id = state.dispatcher.submit(&req.target, req.payload).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchResponse>), ApiError> {
    let jobs = state
        .dispatcher
        .submit_all(&req.targets, req.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(BatchResponse { jobs })))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.dispatcher.query(parse_id(&id)?).await?;
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.dispatcher.cancel(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

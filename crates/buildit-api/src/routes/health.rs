//! Health check endpoints.

use crate::AppState;
use crate::error::ApiError;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde_json::{Value, json};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready once the job store answers.
async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.dispatcher.status().await?;
    Ok(Json(json!({ "status": "ready" })))
}

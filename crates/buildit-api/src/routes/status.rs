//! Fleet status.

use crate::AppState;
use crate::error::ApiError;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use buildit_scheduler::FleetStatus;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(status))
}

async fn status(State(state): State<AppState>) -> Result<Json<FleetStatus>, ApiError> {
    Ok(Json(state.dispatcher.status().await?))
}

//! API routes.

pub mod health;
pub mod jobs;
pub mod status;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .merge(health::router())
        .with_state(state)
}

fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router(state))
        .nest("/status", status::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use buildit_core::payload::BuildRequestSchema;
    use buildit_core::{JobStatus, JobStore, ManualClock, TargetRegistry};
    use buildit_db::{MemoryJobQueue, MemoryJobStore, StoreSettings};
    use buildit_scheduler::Dispatcher;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    fn registry() -> TargetRegistry {
        let mut targets = TargetRegistry::new(["amd64", "arm64"]);
        targets.add_group("mainline", ["amd64", "arm64"]).unwrap();
        targets
    }

    fn app() -> (Router, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new(
            StoreSettings::new(registry(), 3),
            Arc::new(ManualClock::default()),
        ));
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(MemoryJobQueue::new()), registry())
            .with_schema(Arc::new(BuildRequestSchema));
        let state = AppState::new(Arc::new(dispatcher)).with_token(Some(TOKEN.to_string()));
        (router(state), store)
    }

    fn post(uri: &str, body: Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn build_request() -> Value {
        json!({"packages": ["bash"], "git_ref": "stable"})
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get("/health/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_and_query() {
        let (app, store) = app();
        let body = json!({"target": "amd64", "payload": build_request()});
        let response = app
            .clone()
            .oneshot(post("/api/v1/jobs", body, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = json_body(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(get(&format!("/api/v1/jobs/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = json_body(response).await;
        assert_eq!(job["status"], "queued");
        assert_eq!(job["target"], "amd64");
        assert_eq!(job["attempt_count"], 0);

        assert_eq!(store.get(id.parse().unwrap()).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_submit_requires_token() {
        let (app, _) = app();
        let body = json!({"target": "amd64", "payload": build_request()});
        let response = app
            .clone()
            .oneshot(post("/api/v1/jobs", body.clone(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post("/api/v1/jobs", body, Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_target_is_bad_request() {
        let (app, store) = app();
        let body = json!({"target": "z80", "payload": build_request()});
        let response = app
            .oneshot(post("/api/v1/jobs", body, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].as_str().unwrap().contains("z80"));
        assert!(store.summary().await.unwrap().iter().all(|s| s.queued == 0));
    }

    #[tokio::test]
    async fn test_invalid_payload_is_bad_request() {
        let (app, _) = app();
        let body = json!({"target": "amd64", "payload": {"packages": []}});
        let response = app
            .oneshot(post("/api/v1/jobs", body, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_expands_group() {
        let (app, _) = app();
        let body = json!({"targets": ["mainline"], "payload": build_request()});
        let response = app
            .oneshot(post("/api/v1/jobs/batch", body, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let jobs = json_body(response).await["jobs"].as_array().unwrap().clone();
        let targets: Vec<_> = jobs.iter().map(|j| j["target"].clone()).collect();
        assert_eq!(targets, vec![json!("amd64"), json!("arm64")]);
    }

    #[tokio::test]
    async fn test_cancel_then_cancel_again() {
        let (app, _) = app();
        let body = json!({"target": "arm64", "payload": build_request()});
        let response = app
            .clone()
            .oneshot(post("/api/v1/jobs", body, Some(TOKEN)))
            .await
            .unwrap();
        let id = json_body(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();
        let uri = format!("/api/v1/jobs/{}/cancel", id);

        let response = app
            .clone()
            .oneshot(post(&uri, json!({}), Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(post(&uri, json!({}), Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(get(&format!("/api/v1/jobs/{}", buildit_core::JobId::new())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get("/api/v1/jobs/not-a-uuid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_reports_queue_depth() {
        let (app, _) = app();
        let body = json!({"target": "amd64", "payload": build_request()});
        app.clone()
            .oneshot(post("/api/v1/jobs", body, Some(TOKEN)))
            .await
            .unwrap();

        let response = app.oneshot(get("/api/v1/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = json_body(response).await;
        let amd64 = status["targets"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["target"] == "amd64")
            .unwrap()
            .clone();
        assert_eq!(amd64["queued"], 1);
        assert!(status["workers"].as_array().unwrap().is_empty());
    }
}

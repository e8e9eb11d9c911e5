//! HTTP API surface: validation, CRUD over the store, and control
//! endpoints backed by the scheduler handle.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use chime::api::{self, ApiState};
use chime::{ExecutionStatus, ExecutionType, Job, JobStore, MemoryStore};

use crate::common::{start_scheduler, test_config};

/// A schedule that only fires on January 1st at midnight.
const FAR_SCHEDULE: &str = "0 0 0 1 1 *";

async fn test_state() -> (ApiState<MemoryStore>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let (handle, _task) = start_scheduler(Arc::clone(&store), test_config());
    (
        ApiState {
            handle,
            store: Arc::clone(&store),
        },
        store,
    )
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (state, _store) = test_state().await;
    let router = api::router(state);

    let response = router
        .oneshot(empty_request(Method::GET, "/health"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "UP");
    assert_eq!(json["scheduler_running"], true);
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_create_job_and_list() {
    let (state, store) = test_state().await;
    let router = api::router(state);

    let response = router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/jobs",
            json!({
                "schedule": "0 */5 * * * *",
                "target_url": "https://api.example.com/webhook",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["schedule"], "0 */5 * * * *");
    assert_eq!(json["execution_type"], "AT_LEAST_ONCE");
    assert_eq!(json["active"], true);
    assert!(json["next_run_time"].is_string());

    // Persisted and visible through the list endpoint.
    assert_eq!(store.list_jobs(None).await.unwrap().len(), 1);
    let response = router
        .oneshot(empty_request(Method::GET, "/api/v1/jobs"))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["count"], 1);
}

#[tokio::test]
async fn test_create_job_rejects_five_field_cron() {
    let (state, store) = test_state().await;
    let router = api::router(state);

    let response = router
        .oneshot(json_request(
            Method::POST,
            "/api/v1/jobs",
            json!({
                "schedule": "0 * * * *",
                "target_url": "https://api.example.com/webhook",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "BAD_REQUEST");
    assert!(json["error"].as_str().unwrap().contains("expected 6 fields"));

    // Nothing was inserted.
    assert!(store.list_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_job_rejects_bad_url() {
    let (state, _store) = test_state().await;
    let router = api::router(state);

    let response = router
        .oneshot(json_request(
            Method::POST,
            "/api/v1/jobs",
            json!({
                "schedule": "0 * * * * *",
                "target_url": "ftp://example.com/hook",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_unknown_job_is_404() {
    let (state, _store) = test_state().await;
    let router = api::router(state);

    let response = router
        .clone()
        .oneshot(empty_request(
            Method::GET,
            "/api/v1/jobs/00000000-0000-0000-0000-000000000000",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Garbage ids are not found either, never a 500.
    let response = router
        .oneshot(empty_request(Method::GET, "/api/v1/jobs/not-a-uuid"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_job() {
    let (state, store) = test_state().await;
    let router = api::router(state);

    let job = Job::new(FAR_SCHEDULE, "https://example.com/hook", ExecutionType::AtLeastOnce)
        .unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let response = router
        .clone()
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/v1/jobs/{}", job_id),
            json!({ "schedule": "30 * * * * *" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["schedule"], "30 * * * * *");

    // Invalid updates are rejected and change nothing.
    let response = router
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/v1/jobs/{}", job_id),
            json!({ "schedule": "61 * * * * *" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.get_job(&job_id).await.unwrap().schedule, "30 * * * * *");
}

#[tokio::test]
async fn test_delete_job_deactivates() {
    let (state, store) = test_state().await;
    let router = api::router(state);

    let job = Job::new(FAR_SCHEDULE, "https://example.com/hook", ExecutionType::AtLeastOnce)
        .unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let response = router
        .oneshot(empty_request(
            Method::DELETE,
            &format!("/api/v1/jobs/{}", job_id),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!store.get_job(&job_id).await.unwrap().active);
}

#[tokio::test]
async fn test_run_pause_resume_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (state, store) = test_state().await;
    let router = api::router(state);

    let job = Job::new(FAR_SCHEDULE, server.uri(), ExecutionType::AtLeastOnce).unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let response = router
        .clone()
        .oneshot(empty_request(
            Method::POST,
            &format!("/api/v1/jobs/{}/run", job_id),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert!(json["execution_id"].is_string());

    // The dispatched occurrence shows up in the history with drift.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = router
            .clone()
            .oneshot(empty_request(
                Method::GET,
                &format!("/api/v1/jobs/{}/executions", job_id),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        if json["count"] == 1 && json["executions"][0]["status"] == "SUCCESS" {
            assert!(json["executions"][0]["drift_ms"].as_i64().unwrap() >= 0);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution never succeeded: {}",
            json
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let response = router
        .clone()
        .oneshot(empty_request(
            Method::POST,
            &format!("/api/v1/jobs/{}/pause", job_id),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!store.get_job(&job_id).await.unwrap().active);

    let response = router
        .clone()
        .oneshot(empty_request(
            Method::POST,
            &format!("/api/v1/jobs/{}/resume", job_id),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(store.get_job(&job_id).await.unwrap().active);

    // Stats reflect the one successful run.
    let response = router
        .oneshot(empty_request(
            Method::GET,
            &format!("/api/v1/jobs/{}/stats", job_id),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["succeeded"], 1);
    assert_eq!(json["failed"], 0);
}

#[tokio::test]
async fn test_executions_for_unknown_job_is_404() {
    let (state, _store) = test_state().await;
    let router = api::router(state);

    let response = router
        .oneshot(empty_request(
            Method::GET,
            "/api/v1/jobs/00000000-0000-0000-0000-000000000000/executions",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_execution_history_shape() {
    let (state, store) = test_state().await;
    let router = api::router(state);

    let job = Job::new(FAR_SCHEDULE, "https://example.com/hook", ExecutionType::AtLeastOnce)
        .unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let mut execution = chime::Execution::pending(job_id, chrono::Utc::now(), 1);
    execution.status = ExecutionStatus::Success;
    execution.actual_start_time = Some(execution.scheduled_time + chrono::Duration::milliseconds(120));
    execution.http_status = Some(200);
    execution.duration_ms = Some(35);
    store.upsert_execution(&execution).await.unwrap();

    let response = router
        .oneshot(empty_request(
            Method::GET,
            &format!("/api/v1/jobs/{}/executions?limit=5", job_id),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["count"], 1);
    let row = &json["executions"][0];
    assert_eq!(row["status"], "SUCCESS");
    assert_eq!(row["attempt"], 1);
    assert_eq!(row["http_status"], 200);
    assert_eq!(row["duration_ms"], 35);
    assert_eq!(row["drift_ms"], 120);
}

//! Router tests against the recording runtime and in-memory store

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use lab_orchestrator::testing::{MemoryObjectStore, RecordingRuntime};
use lab_orchestrator::{LabOrchestrator, OrchestratorConfig, ProvisioningError};
use lab_server::{router, AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    runtime: RecordingRuntime,
    store: MemoryObjectStore,
}

fn test_app(config: OrchestratorConfig) -> TestApp {
    let runtime = RecordingRuntime::default();
    let store = MemoryObjectStore::default();
    let orchestrator =
        LabOrchestrator::new(config, Arc::new(runtime.clone()), Arc::new(store.clone()))
            .expect("valid config");
    let app = router(Arc::new(AppState::new(Arc::new(orchestrator))));
    TestApp {
        app,
        runtime,
        store,
    }
}

fn request(method: &str, uri: &str, session: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-lab-user", "alice");
    if let Some(session) = session {
        builder = builder.header(header::COOKIE, format!("lab_session={}", session));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value, Response<()>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (parts.status, json, Response::from_parts(parts, ()))
}

fn session_cookie(response: &Response<()>) -> String {
    let raw = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("session cookie issued")
        .to_str()
        .unwrap();
    raw.split(';')
        .next()
        .and_then(|pair| pair.strip_prefix("lab_session="))
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn full_lab_flow_over_http() {
    let t = test_app(OrchestratorConfig::default());

    let (status, body, response) = send(&t.app, request("POST", "/start-lab", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["container_id"], "c-1");
    let session = session_cookie(&response);

    let (status, body, _) = send(
        &t.app,
        request(
            "POST",
            "/validate",
            Some(&session),
            Some(serde_json::json!({ "subnet": "255.255.0.0" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], false);

    let (status, body, _) = send(
        &t.app,
        request(
            "POST",
            "/validate",
            Some(&session),
            Some(serde_json::json!({ "subnet": "255.255.255.0" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], true);
    assert_eq!(body["state"], "validated");
    assert_eq!(body["osi"]["completed_layers"], serde_json::json!([3]));

    let (status, body, _) = send(&t.app, request("POST", "/complete-lab", Some(&session), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uploaded"], true);
    let report_name = body["report_name"].as_str().unwrap().to_string();
    assert!(report_name.starts_with("alice/"));
    assert!(!t.runtime.container_exists("c-1"));

    // Completing again is idempotent
    let (status, body, _) = send(&t.app, request("POST", "/complete-lab", Some(&session), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report_name"], report_name.as_str());
    assert_eq!(t.store.put_count(), 1);

    let (status, body, _) = send(&t.app, request("GET", "/history", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reports"].as_array().unwrap().len(), 1);

    let (status, body, _) = send(&t.app, request("GET", "/session", Some(&session), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
}

#[tokio::test]
async fn second_start_conflicts() {
    let t = test_app(OrchestratorConfig::default());

    let (_, _, response) = send(&t.app, request("POST", "/start-lab", None, None)).await;
    let session = session_cookie(&response);

    let (status, body, response) =
        send(&t.app, request("POST", "/start-lab", Some(&session), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["container_id"].as_str().unwrap().starts_with("ERROR"));
    assert_eq!(body["error"], "already_running");
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    assert_eq!(t.runtime.live_containers(), 1);
}

#[tokio::test]
async fn provisioning_failure_reports_error_marker() {
    let t = test_app(OrchestratorConfig::default());
    t.runtime
        .fail_next_create(ProvisioningError::Runtime("image not available".into()));

    let (status, body, _) = send(&t.app, request("POST", "/start-lab", None, None)).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["container_id"].as_str().unwrap().starts_with("ERROR: "));
    assert_eq!(body["error"], "provisioning_error");
}

#[tokio::test]
async fn capacity_exhaustion_is_service_unavailable() {
    let config = OrchestratorConfig {
        max_active_sessions: 1,
        ..Default::default()
    };
    let t = test_app(config);

    let (status, _, _) = send(&t.app, request("POST", "/start-lab", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body, _) = send(&t.app, request("POST", "/start-lab", None, None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["container_id"].as_str().unwrap().starts_with("ERROR"));
}

#[tokio::test]
async fn validate_without_session_is_not_found() {
    let t = test_app(OrchestratorConfig::default());

    let (status, body, _) = send(
        &t.app,
        request(
            "POST",
            "/validate",
            None,
            Some(serde_json::json!({ "subnet": "255.255.255.0" })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["result"], false);
    assert_eq!(body["code"], "session_not_found");
}

#[tokio::test]
async fn complete_before_validation_conflicts() {
    let t = test_app(OrchestratorConfig::default());
    let (_, _, response) = send(&t.app, request("POST", "/start-lab", None, None)).await;
    let session = session_cookie(&response);

    let (status, body, _) = send(&t.app, request("POST", "/complete-lab", Some(&session), None)).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["uploaded"], false);
    assert_eq!(body["code"], "not_ready");
    assert!(t.runtime.container_exists("c-1"));
}

#[tokio::test]
async fn archive_failure_is_reported_and_retryable() {
    let t = test_app(OrchestratorConfig::default());
    let (_, _, response) = send(&t.app, request("POST", "/start-lab", None, None)).await;
    let session = session_cookie(&response);
    send(
        &t.app,
        request(
            "POST",
            "/validate",
            Some(&session),
            Some(serde_json::json!({ "subnet": "255.255.255.0", "checkpoint": 0 })),
        ),
    )
    .await;

    t.store.fail_next_puts(1);
    let (status, body, _) = send(&t.app, request("POST", "/complete-lab", Some(&session), None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["uploaded"], false);

    let (status, body, _) = send(&t.app, request("POST", "/complete-lab", Some(&session), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uploaded"], true);
    assert_eq!(t.store.object_count(), 1);
}

#[tokio::test]
async fn health_reports_sessions_and_containers() {
    let t = test_app(OrchestratorConfig::default());
    send(&t.app, request("POST", "/start-lab", None, None)).await;

    let (status, body, _) = send(&t.app, request("GET", "/health", None, None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 1);
    assert_eq!(body["containers"]["ready"], 1);
}

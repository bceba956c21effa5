//! Lab session API handlers
//!
//! Response bodies keep the shapes the browser client already understands:
//! `container_id` (with an `ERROR` prefix on failure), `result` and
//! `uploaded`.

use crate::api::identity::{identify, LabIdentity};
use crate::api::status_for;
use crate::observability::{AuditEntry, AuditEventType, AuditLogger};
use crate::state::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use lab_orchestrator::LabError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Prefix the client checks to detect a failed start
pub const ERROR_MARKER: &str = "ERROR";

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub subnet: String,
    /// Defaults to the next pending checkpoint
    #[serde(default)]
    pub checkpoint: Option<usize>,
}

fn audit(identity: &LabIdentity, event: AuditEventType) -> AuditEntry {
    AuditEntry::new(event)
        .session(identity.session_id.as_str())
        .user(&identity.user)
}

pub async fn start_lab(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = identify(&headers);
    let started = Instant::now();

    let response = match state
        .orchestrator
        .start(&identity.session_id, &identity.user)
        .await
    {
        Ok(container) => {
            AuditLogger::log(
                &audit(&identity, AuditEventType::LabStarted)
                    .with_payload(json!({ "container_id": container.container_id }))
                    .elapsed_since(started),
            );
            Json(json!({ "container_id": container.container_id })).into_response()
        }
        Err(e) => {
            AuditLogger::log(
                &audit(&identity, AuditEventType::LabStartFailed)
                    .elapsed_since(started)
                    .failed(&e.to_string()),
            );
            (
                status_for(&e),
                Json(json!({
                    "container_id": format!("{}: {}", ERROR_MARKER, e),
                    "error": e.code(),
                })),
            )
                .into_response()
        }
    };

    identity.attach(response)
}

pub async fn validate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ValidateRequest>,
) -> Response {
    let identity = identify(&headers);
    let orchestrator = &state.orchestrator;

    let outcome = match req.checkpoint {
        Some(index) => {
            orchestrator
                .submit_checkpoint(&identity.session_id, index, &req.subnet)
                .await
        }
        None => {
            orchestrator
                .submit_current(&identity.session_id, &req.subnet)
                .await
        }
    };

    let response = match outcome {
        Ok(snapshot) => {
            AuditLogger::log(
                &audit(&identity, AuditEventType::CheckpointPassed)
                    .with_payload(json!({ "state": snapshot.state.name() })),
            );
            Json(json!({
                "result": true,
                "state": snapshot.state,
                "osi": snapshot.osi,
            }))
            .into_response()
        }
        Err(LabError::ValidationFailed { index }) => {
            AuditLogger::log(
                &audit(&identity, AuditEventType::CheckpointRejected)
                    .with_payload(json!({ "checkpoint": index })),
            );
            Json(json!({ "result": false, "checkpoint": index })).into_response()
        }
        Err(e) => {
            AuditLogger::log(
                &audit(&identity, AuditEventType::CheckpointRefused).failed(&e.to_string()),
            );
            (
                status_for(&e),
                Json(json!({
                    "result": false,
                    "error": e.to_string(),
                    "code": e.code(),
                })),
            )
                .into_response()
        }
    };

    identity.attach(response)
}

pub async fn complete_lab(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = identify(&headers);
    let started = Instant::now();

    let response = match state.orchestrator.complete(&identity.session_id).await {
        Ok(artifact) => {
            AuditLogger::log(
                &audit(&identity, AuditEventType::LabCompleted)
                    .with_payload(json!({ "key": artifact.key, "sha256": artifact.sha256 }))
                    .elapsed_since(started),
            );
            Json(json!({
                "uploaded": true,
                "report_name": artifact.report_name(),
                "location": artifact.location,
            }))
            .into_response()
        }
        Err(e) => {
            let event = match e {
                LabError::Archive(_) => AuditEventType::ArchiveFailed,
                _ => AuditEventType::CheckpointRefused,
            };
            AuditLogger::log(
                &audit(&identity, event)
                    .elapsed_since(started)
                    .failed(&e.to_string()),
            );
            (
                status_for(&e),
                Json(json!({
                    "uploaded": false,
                    "error": e.to_string(),
                    "code": e.code(),
                })),
            )
                .into_response()
        }
    };

    identity.attach(response)
}

/// Current session state, including the OSI layer projection
pub async fn session_status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = identify(&headers);

    let response = match state.orchestrator.status(&identity.session_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (
            status_for(&e),
            Json(json!({ "error": e.to_string(), "code": e.code() })),
        )
            .into_response(),
    };

    identity.attach(response)
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let summary = state.orchestrator.health_summary();
    let status = if summary.all_healthy() { "ok" } else { "degraded" };

    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "uptime_secs": state.uptime_secs(),
            "sessions": state.orchestrator.session_count(),
            "containers": summary,
            "healthy_percent": summary.percentage_healthy(),
        })),
    )
}

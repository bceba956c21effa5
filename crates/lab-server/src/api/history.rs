//! Report history API handlers

use crate::api::identity::user_from;
use crate::api::status_for;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Archived reports for the calling user, newest first
pub async fn list_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let user = user_from(&headers);

    let reports = state.orchestrator.list_reports(&user).await.map_err(|e| {
        warn!(user = %user, error = %e, "Failed to list reports");
        (
            status_for(&e),
            Json(json!({ "success": false, "error": e.to_string() })),
        )
    })?;

    Ok(Json(json!({
        "user": user,
        "reports": reports,
    })))
}

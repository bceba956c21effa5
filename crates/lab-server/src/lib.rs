//! Lab Server - HTTP front end for networking labs
//!
//! Architecture:
//! - Lab API: start a lab, validate checkpoint answers, complete and archive
//! - History API: archived reports per user
//! - Maintenance: idle sweep and container health loops
//!
//! Session identity travels in the `lab_session` cookie; all session state
//! lives in the orchestrator, the browser only renders what it is sent.

pub mod api;
pub mod maintenance;
pub mod observability;
pub mod state;

pub use observability::{init_sentry, AuditEventType, AuditLogger};
pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::lab::health_check))
        // === LAB SESSION API ===
        .route("/start-lab", post(api::lab::start_lab))
        .route("/validate", post(api::lab::validate))
        .route("/complete-lab", post(api::lab::complete_lab))
        .route("/session", get(api::lab::session_status))
        // === HISTORY ===
        .route("/history", get(api::history::list_history))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

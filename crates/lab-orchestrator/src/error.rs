//! Error types for lab session orchestration

use crate::session::{SessionId, SessionState};
use std::time::Duration;
use thiserror::Error;

/// Result type for orchestrator operations
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Errors surfaced to callers of the orchestrator
#[derive(Error, Debug)]
pub enum LabError {
    #[error("Provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Session {session_id} already has a running container ({container_id})")]
    AlreadyRunning {
        session_id: SessionId,
        container_id: String,
    },

    #[error("Invalid checkpoint {got}: expected {}", describe_expected(.expected))]
    InvalidCheckpoint { expected: Option<usize>, got: usize },

    #[error("Checkpoint {index} rejected the submitted answer")]
    ValidationFailed { index: usize },

    #[error("Session not ready (state: {state})")]
    NotReady { state: SessionState },

    #[error("Archive failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Session {0} was abandoned, start a new session")]
    Abandoned(SessionId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LabError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Provisioning(_) => "provisioning_error",
            Self::AlreadyRunning { .. } => "already_running",
            Self::InvalidCheckpoint { .. } => "invalid_checkpoint",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::NotReady { .. } => "not_ready",
            Self::Archive(_) => "archive_error",
            Self::Abandoned(_) => "abandoned_session",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Config(_) => "config_error",
        }
    }
}

fn describe_expected(expected: &Option<usize>) -> String {
    match expected {
        Some(index) => index.to_string(),
        None => "none".to_string(),
    }
}

/// Container runtime failures. Never retried by the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Container creation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

/// Report upload failures. Publishing is safe to retry after any of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upload timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ArchiveError {
    fn from(err: serde_json::Error) -> Self {
        ArchiveError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for ArchiveError {
    fn from(err: reqwest::Error) -> Self {
        ArchiveError::Storage(err.to_string())
    }
}

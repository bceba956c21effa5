//! API handlers

pub mod history;
pub mod identity;
pub mod lab;

use axum::http::StatusCode;
use lab_orchestrator::{LabError, ProvisioningError};

/// HTTP status for an orchestrator error
pub fn status_for(err: &LabError) -> StatusCode {
    match err {
        LabError::Provisioning(ProvisioningError::ResourceExhausted(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        LabError::Provisioning(_) => StatusCode::BAD_GATEWAY,
        LabError::AlreadyRunning { .. }
        | LabError::InvalidCheckpoint { .. }
        | LabError::NotReady { .. } => StatusCode::CONFLICT,
        LabError::ValidationFailed { .. } => StatusCode::OK,
        LabError::Abandoned(_) => StatusCode::GONE,
        LabError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        LabError::Archive(_) | LabError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_orchestrator::{ArchiveError, SessionId, SessionState};
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&LabError::from(ProvisioningError::Timeout(Duration::from_secs(1)))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&LabError::from(ProvisioningError::ResourceExhausted("full".into()))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&LabError::NotReady {
                state: SessionState::Running
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&LabError::Abandoned(SessionId::new())),
            StatusCode::GONE
        );
        assert_eq!(
            status_for(&LabError::from(ArchiveError::Storage("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

//! Lab audit trail and Sentry reporting
//!
//! Every session transition the API or the maintenance loops cause is
//! emitted as an `audit` span. Operational failures (a container that would
//! not start, a lost container, a report that could not be archived) are
//! also sent to Sentry, tagged with the session they belong to. Client
//! mistakes such as wrong answers stay in the log.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, span, warn, Level};

/// Start Sentry when a DSN is configured; the guard flushes on drop
pub fn init_sentry(dsn: Option<&str>, environment: Option<&str>) -> Option<sentry::ClientInitGuard> {
    let dsn = dsn.map(str::trim).filter(|dsn| !dsn.is_empty())?;

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: environment.map(|env| env.to_string().into()),
            send_default_pii: false,
            ..Default::default()
        },
    ));
    if !guard.is_enabled() {
        warn!("Sentry client could not be enabled, error tracking off");
        return None;
    }

    sentry::configure_scope(|scope| scope.set_tag("service", "lab-server"));
    Some(guard)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Session lifecycle
    LabStarted,
    LabStartFailed,
    LabCompleted,
    SessionAbandoned,
    SessionFailed,

    // Checkpoints
    CheckpointPassed,
    CheckpointRejected,
    CheckpointRefused,

    // Archive
    ArchiveFailed,
}

impl AuditEventType {
    /// Sentry level for a failed event of this type; `None` keeps it log-only
    pub fn sentry_level(self) -> Option<sentry::Level> {
        match self {
            Self::LabStartFailed | Self::SessionFailed | Self::ArchiveFailed => {
                Some(sentry::Level::Error)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_else(|_| "unknown".to_string());
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Structured audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event_type: AuditEventType,
    pub session_id: Option<String>,
    pub user: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            session_id: None,
            user: None,
            payload: None,
            duration_ms: None,
            success: true,
            error_message: None,
        }
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Record the time spent since `started`
    pub fn elapsed_since(mut self, started: Instant) -> Self {
        self.duration_ms = Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn failed(mut self, error: &str) -> Self {
        self.success = false;
        self.error_message = Some(error.to_string());
        self
    }
}

pub struct AuditLogger;

impl AuditLogger {
    /// Emit an audit event under an `audit` span
    pub fn log(entry: &AuditEntry) {
        let span = span!(
            Level::INFO,
            "audit",
            event_type = %entry.event_type,
            session_id = entry.session_id.as_deref().unwrap_or("-"),
            user = entry.user.as_deref().unwrap_or("-"),
        );
        let _guard = span.enter();

        match &entry.error_message {
            None => info!(
                payload = ?entry.payload,
                duration_ms = ?entry.duration_ms,
                "Lab event"
            ),
            Some(error) => {
                warn!(error = %error, duration_ms = ?entry.duration_ms, "Lab event failed");
                if let Some(level) = entry.event_type.sentry_level() {
                    Self::report(entry, error, level);
                }
            }
        }
    }

    fn report(entry: &AuditEntry, error: &str, level: sentry::Level) {
        sentry::with_scope(
            |scope| {
                scope.set_tag("event", entry.event_type);
                if let Some(session_id) = &entry.session_id {
                    scope.set_tag("session_id", session_id);
                }
                if let Some(user) = &entry.user {
                    scope.set_user(Some(sentry::User {
                        username: Some(user.clone()),
                        ..Default::default()
                    }));
                }
                if let Some(payload) = &entry.payload {
                    scope.set_extra("payload", payload.clone());
                }
            },
            || sentry::capture_message(&format!("{}: {}", entry.event_type, error), level),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_entry_builder() {
        let entry = AuditEntry::new(AuditEventType::LabStarted)
            .session("abc123")
            .user("alice")
            .with_payload(serde_json::json!({"container_id": "c-1"}))
            .elapsed_since(Instant::now());

        assert!(entry.success);
        assert_eq!(entry.session_id, Some("abc123".to_string()));
        assert_eq!(entry.user, Some("alice".to_string()));
        assert!(entry.duration_ms.is_some());
    }

    #[test]
    fn test_operational_failures_reach_sentry_with_session_tag() {
        let events = sentry::test::with_captured_events(|| {
            AuditLogger::log(
                &AuditEntry::new(AuditEventType::ArchiveFailed)
                    .session("abc123")
                    .user("alice")
                    .failed("upload timed out"),
            );
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.level, sentry::Level::Error);
        assert_eq!(event.tags.get("session_id").map(String::as_str), Some("abc123"));
        assert_eq!(event.tags.get("event").map(String::as_str), Some("archive_failed"));
        assert_eq!(
            event.user.as_ref().and_then(|u| u.username.as_deref()),
            Some("alice")
        );
    }

    #[test]
    fn test_client_errors_stay_out_of_sentry() {
        let events = sentry::test::with_captured_events(|| {
            AuditLogger::log(
                &AuditEntry::new(AuditEventType::CheckpointRefused)
                    .session("abc123")
                    .failed("checkpoint 1 submitted while 0 is pending"),
            );
            AuditLogger::log(&AuditEntry::new(AuditEventType::LabStarted).session("abc123"));
        });

        assert!(events.is_empty());
    }

    #[test]
    fn test_init_sentry_without_dsn() {
        assert!(init_sentry(None, None).is_none());
        assert!(init_sentry(Some("  "), Some("test")).is_none());
    }

    #[test]
    fn test_audit_entry_failed() {
        let entry = AuditEntry::new(AuditEventType::ArchiveFailed)
            .session("abc123")
            .failed("Upload timed out");

        assert!(!entry.success);
        assert_eq!(entry.error_message, Some("Upload timed out".to_string()));
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(AuditEventType::CheckpointPassed.to_string(), "checkpoint_passed");
        assert_eq!(AuditEventType::LabStartFailed.to_string(), "lab_start_failed");
    }
}

//! Lab report publishing
//!
//! A completed session produces one JSON report stored under a key derived
//! only from the session, so re-publishing after a failed or timed-out upload
//! overwrites the same object instead of creating a duplicate.

use crate::config::ArchiveConfig;
use crate::error::ArchiveError;
use crate::session::{CheckpointStatus, Session};
use crate::store::ObjectStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

const REPORT_CONTENT_TYPE: &str = "application/json";

/// Where a published report lives
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub location: String,
    pub size_bytes: usize,
    /// Hex SHA-256 of the report body
    pub sha256: String,
}

impl ArtifactRef {
    /// Key without the storage prefix, e.g. `alice/20240101T120000Z-3f2a.../report-v1.json`
    pub fn report_name(&self) -> &str {
        self.key
            .split_once('/')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCheckpoint {
    pub name: String,
    pub layer: u8,
    pub status: CheckpointStatus,
    pub attempts: u32,
    pub passed_at: Option<DateTime<Utc>>,
}

/// Completion report uploaded for a validated session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabReport {
    pub schema_version: u32,
    pub session_id: String,
    pub user: String,
    pub status: String,
    /// Percentage of checkpoints passed
    pub score: u32,
    pub topology: String,
    pub checkpoints: Vec<ReportCheckpoint>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Builds reports and writes them to the object store
pub struct ArchivePublisher {
    store: Arc<dyn ObjectStore>,
    config: ArchiveConfig,
}

impl ArchivePublisher {
    pub fn new(store: Arc<dyn ObjectStore>, config: ArchiveConfig) -> Self {
        Self { store, config }
    }

    /// Deterministic key for a session's report. The creation timestamp
    /// leads the session segment so keys sort chronologically.
    pub fn artifact_key(&self, session: &Session) -> String {
        format!(
            "{}/{}/{}-{}/report-v{}.json",
            self.config.prefix,
            user_segment(&session.user),
            session.created_at.format("%Y%m%dT%H%M%SZ"),
            session.id,
            self.config.report_version
        )
    }

    fn user_prefix(&self, user: &str) -> String {
        format!("{}/{}/", self.config.prefix, user_segment(user))
    }

    /// Build the report from session state only, so retries render identical bytes
    pub fn build_report(&self, session: &Session) -> LabReport {
        let total = session.checkpoints.len();
        let passed = session
            .checkpoints
            .iter()
            .filter(|c| c.status == CheckpointStatus::Passed)
            .count();
        let score = if total == 0 {
            0
        } else {
            (passed * 100 / total) as u32
        };

        LabReport {
            schema_version: self.config.report_version,
            session_id: session.id.to_string(),
            user: session.user.clone(),
            status: if passed == total { "Success" } else { "Incomplete" }.to_string(),
            score,
            topology: self.config.topology.clone(),
            checkpoints: session
                .checkpoints
                .iter()
                .map(|c| ReportCheckpoint {
                    name: c.name.clone(),
                    layer: c.layer,
                    status: c.status,
                    attempts: c.attempts,
                    passed_at: c.passed_at,
                })
                .collect(),
            started_at: session.created_at,
            finished_at: session.validated_at().unwrap_or(session.last_active_at),
        }
    }

    pub fn render(&self, report: &LabReport) -> Result<Vec<u8>, ArchiveError> {
        Ok(serde_json::to_vec_pretty(report)?)
    }

    /// Upload the session's report, bounded by the configured timeout
    pub async fn publish(&self, session: &Session) -> Result<ArtifactRef, ArchiveError> {
        let key = self.artifact_key(session);
        let body = self.render(&self.build_report(session))?;
        let sha256 = hex::encode(Sha256::digest(&body));
        let size_bytes = body.len();

        let upload = self.store.put(&key, body, REPORT_CONTENT_TYPE);
        let location = match tokio::time::timeout(self.config.upload_timeout, upload).await {
            Ok(Ok(location)) => location,
            Ok(Err(e)) => {
                warn!(session_id = %session.id, key = %key, error = %e, "Report upload failed");
                return Err(e);
            }
            Err(_) => {
                warn!(session_id = %session.id, key = %key, "Report upload timed out");
                return Err(ArchiveError::Timeout(self.config.upload_timeout));
            }
        };

        info!(
            session_id = %session.id,
            key = %key,
            bytes = size_bytes,
            "Lab report published"
        );

        Ok(ArtifactRef {
            key,
            location,
            size_bytes,
            sha256,
        })
    }

    /// Report keys for `user`, newest first
    pub async fn list_reports(&self, user: &str) -> Result<Vec<String>, ArchiveError> {
        let mut keys = self.store.list(&self.user_prefix(user)).await?;
        keys.sort_unstable_by(|a, b| b.cmp(a));
        Ok(keys)
    }
}

/// Encode a user name as one object key segment.
///
/// ASCII letters, digits, `-`, `@` and non-leading `.` pass through. Every
/// other byte, `_` included, becomes `_XX`, so distinct names never share a
/// prefix and no segment starts with a dot.
fn user_segment(user: &str) -> String {
    if user.is_empty() {
        return "anonymous".to_string();
    }

    let mut segment = String::with_capacity(user.len());
    for (position, byte) in user.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'@')
            || (byte == b'.' && position > 0);
        if plain {
            segment.push(char::from(byte));
        } else {
            segment.push_str(&format!("_{:02X}", byte));
        }
    }
    segment
}

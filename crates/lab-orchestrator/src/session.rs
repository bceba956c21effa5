//! Lab session state machine
//!
//! Handles state transitions for a session:
//! Pending -> Provisioning -> Running -> Validated -> Completed
//!
//! Error edges: Provisioning -> Failed, Running -> Failed (container lost),
//! and any non-terminal state -> Abandoned on idle timeout.
//!
//! `Session` only holds data and enforces ordering rules. Anything that talks
//! to the container runtime or object store lives in `LabOrchestrator`.

use crate::archive::ArtifactRef;
use crate::config::CheckpointDefinition;
use crate::error::{LabError, LabResult};
use crate::provisioner::ContainerRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const MAX_SESSION_ID_LEN: usize = 128;

/// Opaque session token bound to the requesting browser
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh random session id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Accept a client-supplied token if it is safe to use in keys and names
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw.len() <= MAX_SESSION_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for container names and logs
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no container requested yet
    Pending,
    /// Container creation in flight
    Provisioning,
    /// Container ready, checkpoints being worked through
    Running,
    /// Every checkpoint passed, waiting for completion
    Validated,
    /// Report archived and container torn down
    Completed,
    /// Provisioning failed or the container was lost
    Failed(String),
    /// Reclaimed after idling past the timeout
    Abandoned,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Validated => "validated",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Abandoned)
    }

    /// Check if a state transition is valid
    pub fn can_transition_to(&self, to: &SessionState) -> bool {
        match (self, to) {
            // From Pending
            (Self::Pending, Self::Provisioning) => true,

            // From Provisioning
            (Self::Provisioning, Self::Running) => true,
            (Self::Provisioning, Self::Failed(_)) => true,

            // From Running
            (Self::Running, Self::Validated) => true,
            (Self::Running, Self::Failed(_)) => true,

            // From Validated
            (Self::Validated, Self::Completed) => true,

            // Idle reclamation
            (from, Self::Abandoned) => !from.is_terminal(),

            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Passed,
    /// Never passed before the session failed or was abandoned
    Failed,
}

/// A checkpoint definition plus the session's progress on it
#[derive(Clone, Debug, Serialize)]
pub struct CheckpointProgress {
    pub index: usize,
    pub name: String,
    pub layer: u8,
    pub kind: String,
    pub status: CheckpointStatus,
    pub attempts: u32,
    pub passed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub expected: String,
}

impl CheckpointProgress {
    fn new(index: usize, definition: &CheckpointDefinition) -> Self {
        Self {
            index,
            name: definition.name.clone(),
            layer: definition.layer,
            kind: definition.kind.clone(),
            status: CheckpointStatus::Pending,
            attempts: 0,
            passed_at: None,
            expected: definition.expected.clone(),
        }
    }
}

/// Server-side projection of the OSI progress widget
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OsiProgress {
    /// Layer of the checkpoint currently being worked on
    pub active_layer: Option<u8>,
    /// Layers whose checkpoints have all passed
    pub completed_layers: Vec<u8>,
}

/// Read-only view of a session returned to callers
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub user: String,
    pub state: SessionState,
    pub container_id: Option<String>,
    pub checkpoints: Vec<CheckpointProgress>,
    pub osi: OsiProgress,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub artifact: Option<ArtifactRef>,
}

/// One user's lab attempt
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub user: String,
    pub state: SessionState,
    pub checkpoints: Vec<CheckpointProgress>,
    /// Non-owning reference; the provisioner owns the handle
    pub container: Option<ContainerRef>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub artifact: Option<ArtifactRef>,
}

impl Session {
    pub fn new(id: SessionId, user: &str, definitions: &[CheckpointDefinition]) -> Self {
        Self::new_at(id, user, definitions, Utc::now())
    }

    pub fn new_at(
        id: SessionId,
        user: &str,
        definitions: &[CheckpointDefinition],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user: user.to_string(),
            state: SessionState::Pending,
            checkpoints: definitions
                .iter()
                .enumerate()
                .map(|(index, definition)| CheckpointProgress::new(index, definition))
                .collect(),
            container: None,
            created_at: now,
            last_active_at: now,
            completed_at: None,
            artifact: None,
        }
    }

    /// Move to `to`, rejecting edges the lifecycle does not allow
    pub fn transition(&mut self, to: SessionState) -> LabResult<()> {
        if !self.state.can_transition_to(&to) {
            return Err(LabError::NotReady {
                state: self.state.clone(),
            });
        }
        tracing::debug!(
            session_id = %self.id,
            from = %self.state,
            to = %to,
            "Session state changed"
        );
        self.state = to;
        Ok(())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active_at = now;
    }

    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_active_at) > timeout
    }

    /// Index of the first checkpoint not yet passed
    pub fn next_pending(&self) -> Option<usize> {
        self.checkpoints
            .iter()
            .position(|c| c.status != CheckpointStatus::Passed)
    }

    pub fn all_passed(&self) -> bool {
        self.next_pending().is_none()
    }

    /// Check that `index` may be submitted right now
    pub fn ensure_submittable(&self, index: usize) -> LabResult<()> {
        match self.state {
            SessionState::Running | SessionState::Validated => {}
            SessionState::Abandoned => return Err(LabError::Abandoned(self.id.clone())),
            _ => {
                return Err(LabError::NotReady {
                    state: self.state.clone(),
                })
            }
        }

        let expected = self.next_pending();
        if expected != Some(index) {
            return Err(LabError::InvalidCheckpoint {
                expected,
                got: index,
            });
        }
        Ok(())
    }

    /// Record a successful submission; moves to `Validated` after the last one
    pub fn record_pass(&mut self, index: usize, now: DateTime<Utc>) -> LabResult<()> {
        self.ensure_submittable(index)?;
        let checkpoint = &mut self.checkpoints[index];
        checkpoint.attempts += 1;
        checkpoint.status = CheckpointStatus::Passed;
        checkpoint.passed_at = Some(now);

        if self.all_passed() {
            self.transition(SessionState::Validated)?;
        }
        Ok(())
    }

    /// Record a rejected submission; the checkpoint stays pending
    pub fn record_rejection(&mut self, index: usize) -> LabResult<()> {
        self.ensure_submittable(index)?;
        self.checkpoints[index].attempts += 1;
        Ok(())
    }

    /// Time the final checkpoint passed
    pub fn validated_at(&self) -> Option<DateTime<Utc>> {
        if !self.all_passed() {
            return None;
        }
        self.checkpoints.iter().filter_map(|c| c.passed_at).max()
    }

    /// Mark checkpoints that never passed as failed (terminal states only)
    pub fn fail_unfinished(&mut self) {
        for checkpoint in &mut self.checkpoints {
            if checkpoint.status == CheckpointStatus::Pending {
                checkpoint.status = CheckpointStatus::Failed;
            }
        }
    }

    pub fn osi_progress(&self) -> OsiProgress {
        let mut completed_layers: Vec<u8> = Vec::new();
        for checkpoint in &self.checkpoints {
            let layer_done = self
                .checkpoints
                .iter()
                .filter(|c| c.layer == checkpoint.layer)
                .all(|c| c.status == CheckpointStatus::Passed);
            if layer_done && !completed_layers.contains(&checkpoint.layer) {
                completed_layers.push(checkpoint.layer);
            }
        }

        let active_layer = match self.state {
            SessionState::Running => self.next_pending().map(|i| self.checkpoints[i].layer),
            _ => None,
        };

        OsiProgress {
            active_layer,
            completed_layers,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            user: self.user.clone(),
            state: self.state.clone(),
            container_id: self.container.as_ref().map(|c| c.container_id.clone()),
            checkpoints: self.checkpoints.clone(),
            osi: self.osi_progress(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            completed_at: self.completed_at,
            artifact: self.artifact.clone(),
        }
    }
}

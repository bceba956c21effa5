//! Lab Session Orchestrator
//!
//! Runs hands-on networking labs. Provides:
//! - One sandbox container per session, created and torn down on demand
//! - Ordered checkpoint validation through pluggable pure validators
//! - Idempotent report archival on completion
//! - Idle-session reclamation and container health monitoring

pub mod archive;
pub mod config;
pub mod docker;
pub mod error;
pub mod health;
pub mod provisioner;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod validation;

pub use archive::*;
pub use config::*;
pub use docker::*;
pub use error::*;
pub use health::*;
pub use provisioner::*;
pub use registry::*;
pub use runtime::*;
pub use session::*;
pub use store::*;
pub use validation::*;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Main orchestrator owning every lab session
pub struct LabOrchestrator {
    config: OrchestratorConfig,
    registry: SessionRegistry,
    provisioner: ContainerProvisioner,
    validators: ValidatorRegistry,
    publisher: ArchivePublisher,
}

/// Outcome of one maintenance sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    pub abandoned: Vec<SessionId>,
    pub pruned_sessions: usize,
    pub pruned_handles: usize,
    pub orphans: CleanupResult,
}

impl LabOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ObjectStore>,
    ) -> LabResult<Self> {
        Self::with_validators(config, runtime, store, ValidatorRegistry::with_builtins())
    }

    pub fn with_validators(
        config: OrchestratorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ObjectStore>,
        validators: ValidatorRegistry,
    ) -> LabResult<Self> {
        config.validate(&validators)?;

        let provisioner = ContainerProvisioner::new(
            runtime,
            config.sandbox.clone(),
            config.create_timeout,
            config.max_active_sessions,
        );
        let publisher = ArchivePublisher::new(store, config.archive.clone());

        Ok(Self {
            config,
            registry: SessionRegistry::new(),
            provisioner,
            validators,
            publisher,
        })
    }

    /// Build an orchestrator backed by the local Docker daemon
    pub async fn connect_docker(
        config: OrchestratorConfig,
        store: Arc<dyn ObjectStore>,
    ) -> anyhow::Result<Self> {
        let runtime = DockerRuntime::connect().await?;
        runtime.ensure_network(&config.sandbox.network_name).await?;
        Ok(Self::new(config, Arc::new(runtime), store)?)
    }

    /// Start a lab for `session_id`, provisioning its sandbox container
    pub async fn start(&self, session_id: &SessionId, user: &str) -> LabResult<ContainerRef> {
        let cell = self.registry.get_or_create(session_id, || {
            Session::new(session_id.clone(), user, &self.config.checkpoints)
        });
        let mut session = cell.lock().await;

        if let Some(container) = &session.container {
            return Err(LabError::AlreadyRunning {
                session_id: session_id.clone(),
                container_id: container.container_id.clone(),
            });
        }

        // A start in progress holds the lock until it leaves `Provisioning`,
        // so seeing that state here means the previous start was dropped.
        if session.state.is_terminal() || session.state == SessionState::Provisioning {
            debug!(
                session_id = %session_id,
                previous = %session.state,
                "Replacing finished session"
            );
            *session = Session::new(session_id.clone(), user, &self.config.checkpoints);
        }

        session.transition(SessionState::Provisioning)?;
        session.touch(Utc::now());

        match self.provisioner.create(session_id).await {
            Ok(handle) => {
                let container = handle.to_ref();
                session.container = Some(container.clone());
                session.transition(SessionState::Running)?;
                session.touch(Utc::now());
                info!(
                    session_id = %session_id,
                    user = %session.user,
                    container_id = %container.container_id,
                    "Lab session running"
                );
                Ok(container)
            }
            Err(e) => {
                session.transition(SessionState::Failed(e.to_string()))?;
                session.fail_unfinished();
                Err(e.into())
            }
        }
    }

    /// Submit an answer for checkpoint `index`
    pub async fn submit_checkpoint(
        &self,
        session_id: &SessionId,
        index: usize,
        answer: &str,
    ) -> LabResult<SessionSnapshot> {
        let cell = self.cell(session_id)?;
        let mut session = cell.lock().await;
        self.submit_locked(&mut session, index, answer)
    }

    /// Submit an answer for whichever checkpoint is next
    pub async fn submit_current(&self, session_id: &SessionId, answer: &str) -> LabResult<SessionSnapshot> {
        let cell = self.cell(session_id)?;
        let mut session = cell.lock().await;

        match session.next_pending() {
            Some(index) => self.submit_locked(&mut session, index, answer),
            None if session.state == SessionState::Abandoned => {
                Err(LabError::Abandoned(session_id.clone()))
            }
            None => Err(LabError::InvalidCheckpoint {
                expected: None,
                got: 0,
            }),
        }
    }

    fn submit_locked(
        &self,
        session: &mut Session,
        index: usize,
        answer: &str,
    ) -> LabResult<SessionSnapshot> {
        session.ensure_submittable(index)?;

        let checkpoint = &session.checkpoints[index];
        let passed = self
            .validators
            .validate(&checkpoint.kind, &checkpoint.expected, answer)
            .ok_or_else(|| {
                LabError::Config(format!("no validator registered for '{}'", checkpoint.kind))
            })?;

        let now = Utc::now();
        session.touch(now);

        if passed {
            session.record_pass(index, now)?;
            info!(
                session_id = %session.id,
                checkpoint = index,
                state = %session.state,
                "Checkpoint passed"
            );
            Ok(session.snapshot())
        } else {
            session.record_rejection(index)?;
            debug!(session_id = %session.id, checkpoint = index, "Checkpoint answer rejected");
            Err(LabError::ValidationFailed { index })
        }
    }

    /// Archive the report and tear down the container.
    ///
    /// Calling this again on a completed session returns the stored artifact.
    pub async fn complete(&self, session_id: &SessionId) -> LabResult<ArtifactRef> {
        let cell = self.cell(session_id)?;
        let mut session = cell.lock().await;

        match session.state {
            SessionState::Completed => {
                if let Some(artifact) = session.artifact.clone() {
                    debug!(session_id = %session_id, "Session already completed");
                    return Ok(artifact);
                }
                return Err(LabError::NotReady {
                    state: session.state.clone(),
                });
            }
            SessionState::Abandoned => return Err(LabError::Abandoned(session_id.clone())),
            SessionState::Validated => {}
            _ => {
                return Err(LabError::NotReady {
                    state: session.state.clone(),
                })
            }
        }

        let artifact = match session.artifact.clone() {
            Some(artifact) => artifact,
            None => {
                let artifact = self.publisher.publish(&session).await?;
                session.artifact = Some(artifact.clone());
                artifact
            }
        };

        if let Some(container) = session.container.take() {
            self.provisioner.destroy(&container).await;
        }

        let now = Utc::now();
        session.completed_at = Some(now);
        session.touch(now);
        session.transition(SessionState::Completed)?;

        info!(
            session_id = %session_id,
            key = %artifact.key,
            "Lab session completed"
        );
        Ok(artifact)
    }

    pub async fn status(&self, session_id: &SessionId) -> LabResult<SessionSnapshot> {
        let cell = self.cell(session_id)?;
        let session = cell.lock().await;
        Ok(session.snapshot())
    }

    /// Archived report keys for `user`, newest first
    pub async fn list_reports(&self, user: &str) -> LabResult<Vec<String>> {
        Ok(self.publisher.list_reports(user).await?)
    }

    /// Abandon sessions idle past the timeout and destroy their containers
    pub async fn reclaim_idle(&self) -> Vec<SessionId> {
        self.reclaim_idle_at(Utc::now()).await
    }

    pub async fn reclaim_idle_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let mut abandoned = Vec::new();

        for (session_id, cell) in self.registry.cells() {
            // A session locked by a request is active by definition
            let Ok(mut session) = cell.try_lock() else {
                continue;
            };
            if session.state.is_terminal() || !session.is_idle(now, self.config.idle_timeout) {
                continue;
            }

            let container = session.container.take();
            if let Err(e) = session.transition(SessionState::Abandoned) {
                warn!(session_id = %session_id, error = %e, "Could not abandon session");
                continue;
            }
            session.fail_unfinished();
            if let Some(container) = container {
                self.provisioner.destroy(&container).await;
            }

            info!(session_id = %session_id, "Reclaimed idle lab session");
            abandoned.push(session_id);
        }

        abandoned
    }

    /// Fail running sessions whose container is gone
    pub async fn check_health(&self) -> HealthCheckReport {
        let mut report = HealthCheckReport::default();

        for (session_id, cell) in self.registry.cells() {
            let Ok(mut session) = cell.try_lock() else {
                continue;
            };
            if session.state != SessionState::Running {
                continue;
            }
            let Some(container) = session.container.clone() else {
                continue;
            };

            report.checked += 1;
            if self.provisioner.health_check(&container).await == HealthStatus::Ready {
                continue;
            }

            session.container = None;
            if let Err(e) = session.transition(SessionState::Failed("container lost".into())) {
                warn!(session_id = %session_id, error = %e, "Could not fail session");
                continue;
            }
            session.fail_unfinished();
            self.provisioner.destroy(&container).await;

            warn!(
                session_id = %session_id,
                container_id = %container.container_id,
                "Lab container lost, session failed"
            );
            report.lost.push(session_id);
        }

        report
    }

    /// Reclaim idle sessions, prune old tombstones and reap orphans
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let abandoned = self.reclaim_idle_at(now).await;
        let pruned_sessions = self
            .registry
            .prune_terminated(now, self.config.tombstone_ttl);
        let cutoff = chrono::Duration::from_std(self.config.tombstone_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pruned_handles = self.provisioner.prune_terminated(cutoff);
        let orphans = self.provisioner.reap_orphans().await;

        SweepReport {
            abandoned,
            pruned_sessions,
            pruned_handles,
            orphans,
        }
    }

    /// Destroy every live container, abandoning unfinished sessions
    pub async fn shutdown(&self) {
        let teardowns = self.registry.cells().into_iter().map(|(session_id, cell)| async move {
            let mut session = cell.lock().await;
            let container = session.container.take();
            if !session.state.is_terminal() {
                if let Err(e) = session.transition(SessionState::Abandoned) {
                    warn!(session_id = %session_id, error = %e, "Could not abandon session");
                }
                session.fail_unfinished();
            }
            match container {
                Some(container) => {
                    self.provisioner.destroy(&container).await;
                    1
                }
                None => 0,
            }
        });

        let destroyed: usize = join_all(teardowns).await.into_iter().sum();
        info!(destroyed, "Lab orchestrator shut down");
    }

    pub fn health_summary(&self) -> HealthSummary {
        self.provisioner.summary()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.registry.snapshot()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &ContainerProvisioner {
        &self.provisioner
    }

    pub fn validators(&self) -> &ValidatorRegistry {
        &self.validators
    }

    fn cell(&self, session_id: &SessionId) -> LabResult<SessionCell> {
        self.registry
            .get(session_id)
            .ok_or_else(|| LabError::SessionNotFound(session_id.clone()))
    }
}

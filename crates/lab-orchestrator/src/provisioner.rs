//! Per-session sandbox provisioning
//!
//! The provisioner owns every `ContainerHandle`. Sessions only ever hold a
//! `ContainerRef` and ask the provisioner to create or destroy containers.
//!
//! Guarantees:
//! - creation is bounded by `create_timeout`; on timeout or any mid-way
//!   failure the container is removed by its pre-generated name
//! - creation runs on its own task, so a caller dropped mid-way never
//!   leaves a container behind
//! - `destroy` never fails the caller and is a no-op once terminated
//! - at most `max_active_sessions` live containers exist at once

use crate::config::SandboxConfig;
use crate::error::ProvisioningError;
use crate::health::HealthSummary;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ResourceLimits, LABEL_MANAGED, LABEL_SESSION,
};
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Starting,
    Ready,
    Unhealthy,
    /// Teardown failed; the reaper retries later
    Error,
    Terminated,
}

impl ContainerStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Unhealthy)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ready,
    Unhealthy,
}

/// Provisioned sandbox, owned by the provisioner
#[derive(Clone, Debug, Serialize)]
pub struct ContainerHandle {
    pub container_id: String,
    pub name: String,
    pub session_id: SessionId,
    pub image: String,
    pub status: ContainerStatus,
    pub limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl ContainerHandle {
    pub fn to_ref(&self) -> ContainerRef {
        ContainerRef {
            container_id: self.container_id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Non-owning reference a session keeps to its container
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container_id: String,
    pub name: String,
}

struct HandleEntry {
    handle: ContainerHandle,
    /// Capacity slot, released when the container is terminated
    permit: Option<OwnedSemaphorePermit>,
}

/// Result of an orphan sweep
#[derive(Debug, Default)]
pub struct CleanupResult {
    pub total_found: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

impl CleanupResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Creates, health-checks and destroys per-session sandboxes
pub struct ContainerProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    sandbox: SandboxConfig,
    create_timeout: Duration,
    capacity: Arc<Semaphore>,
    max_active: usize,
    handles: RwLock<HashMap<String, HandleEntry>>,
    /// Names of containers currently being created
    in_flight: Arc<RwLock<HashSet<String>>>,
}

impl ContainerProvisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sandbox: SandboxConfig,
        create_timeout: Duration,
        max_active: usize,
    ) -> Self {
        Self {
            runtime,
            sandbox,
            create_timeout,
            capacity: Arc::new(Semaphore::new(max_active)),
            max_active,
            handles: RwLock::new(HashMap::new()),
            in_flight: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Unique container name for a new sandbox of `session_id`
    pub fn container_name(&self, session_id: &SessionId) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}",
            self.sandbox.name_prefix,
            session_id.short(),
            &nonce[..8]
        )
    }

    fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: memory_bytes(self.sandbox.memory_mb),
            cpu_cores: self.sandbox.cpu_cores,
            pids_limit: self.sandbox.pids_limit,
        }
    }

    fn spec_for(&self, session_id: &SessionId, name: String) -> ContainerSpec {
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SESSION.to_string(), session_id.to_string());

        ContainerSpec {
            name,
            image: self.sandbox.image.clone(),
            network: self.sandbox.network_name.clone(),
            limits: self.limits(),
            labels,
            env: vec![format!("LAB_SESSION={}", session_id)],
        }
    }

    /// Provision a sandbox for `session_id`
    pub async fn create(&self, session_id: &SessionId) -> Result<ContainerHandle, ProvisioningError> {
        let permit = self.capacity.clone().try_acquire_owned().map_err(|_| {
            ProvisioningError::ResourceExhausted(format!(
                "all {} lab container slots are in use",
                self.max_active
            ))
        })?;

        let spec = self.spec_for(session_id, self.container_name(session_id));
        self.in_flight.write().insert(spec.name.clone());

        let (reply, outcome) = oneshot::channel();
        let task = ProvisionTask {
            runtime: Arc::clone(&self.runtime),
            in_flight: Arc::clone(&self.in_flight),
            create_timeout: self.create_timeout,
            session_id: session_id.clone(),
            spec: spec.clone(),
        };
        tokio::spawn(task.run(permit, reply));

        let (container_id, permit) = outcome.await.map_err(|_| {
            ProvisioningError::Runtime("provisioning task ended without a result".into())
        })??;

        let handle = ContainerHandle {
            container_id: container_id.clone(),
            name: spec.name,
            session_id: session_id.clone(),
            image: spec.image,
            status: ContainerStatus::Ready,
            limits: spec.limits,
            created_at: Utc::now(),
            terminated_at: None,
        };

        self.handles.write().insert(
            container_id.clone(),
            HandleEntry {
                handle: handle.clone(),
                permit: Some(permit),
            },
        );

        info!(
            session_id = %session_id,
            container_id = %container_id,
            "Lab container ready"
        );
        Ok(handle)
    }

    /// Tear down a container. Failures are logged, never returned.
    pub async fn destroy(&self, container: &ContainerRef) {
        let status = self
            .handles
            .read()
            .get(&container.container_id)
            .map(|entry| entry.handle.status.clone());

        if status == Some(ContainerStatus::Terminated) {
            debug!(container_id = %container.container_id, "Container already terminated");
            return;
        }

        match self.runtime.remove_container(&container.container_id).await {
            Ok(()) => {
                if let Some(entry) = self.handles.write().get_mut(&container.container_id) {
                    entry.handle.status = ContainerStatus::Terminated;
                    entry.handle.terminated_at = Some(Utc::now());
                    entry.permit = None;
                }
                info!(container_id = %container.container_id, "Lab container destroyed");
            }
            Err(e) => {
                if let Some(entry) = self.handles.write().get_mut(&container.container_id) {
                    entry.handle.status = ContainerStatus::Error;
                }
                warn!(
                    container_id = %container.container_id,
                    error = %e,
                    "Container teardown failed, leaving it for the reaper"
                );
            }
        }
    }

    /// Ask the runtime whether the container is still alive
    pub async fn health_check(&self, container: &ContainerRef) -> HealthStatus {
        let health = match self.runtime.is_running(&container.container_id).await {
            Ok(true) => HealthStatus::Ready,
            Ok(false) => HealthStatus::Unhealthy,
            Err(e) => {
                warn!(
                    container_id = %container.container_id,
                    error = %e,
                    "Health check failed"
                );
                HealthStatus::Unhealthy
            }
        };

        if let Some(entry) = self.handles.write().get_mut(&container.container_id) {
            if entry.handle.status.is_live() {
                let new_status = match health {
                    HealthStatus::Ready => ContainerStatus::Ready,
                    HealthStatus::Unhealthy => ContainerStatus::Unhealthy,
                };
                if entry.handle.status != new_status {
                    info!(
                        container_id = %container.container_id,
                        old_status = ?entry.handle.status,
                        new_status = ?new_status,
                        "Container status changed"
                    );
                    entry.handle.status = new_status;
                }
            }
        }

        health
    }

    pub fn handle(&self, container_id: &str) -> Option<ContainerHandle> {
        self.handles
            .read()
            .get(container_id)
            .map(|entry| entry.handle.clone())
    }

    pub fn live_handles(&self) -> Vec<ContainerHandle> {
        self.handles
            .read()
            .values()
            .filter(|entry| entry.handle.status.is_live())
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Live containers owned by one session
    pub fn live_count_for(&self, session_id: &SessionId) -> usize {
        self.handles
            .read()
            .values()
            .filter(|entry| entry.handle.status.is_live() && &entry.handle.session_id == session_id)
            .count()
    }

    /// Container capacity still available
    pub fn available_slots(&self) -> usize {
        self.capacity.available_permits()
    }

    /// Remove lab-managed containers no live handle accounts for
    pub async fn reap_orphans(&self) -> CleanupResult {
        let mut result = CleanupResult::default();

        let containers = match self.runtime.list_managed_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Could not list lab containers for reaping");
                result.errors.push(e.to_string());
                return result;
            }
        };

        for container in containers {
            let owned = self
                .handles
                .read()
                .get(&container.id)
                .map(|entry| entry.handle.status.is_live())
                .unwrap_or(false);
            let creating = self.in_flight.read().contains(&container.name);
            if owned || creating {
                continue;
            }

            result.total_found += 1;
            match self.runtime.remove_container(&container.id).await {
                Ok(()) => {
                    info!(
                        container_id = %container.id,
                        session_id = ?container.session_id,
                        "Removed orphaned lab container"
                    );
                    result.removed += 1;
                    if let Some(entry) = self.handles.write().get_mut(&container.id) {
                        entry.handle.status = ContainerStatus::Terminated;
                        entry.handle.terminated_at = Some(Utc::now());
                        entry.permit = None;
                    }
                }
                Err(e) => {
                    warn!(container_id = %container.id, error = %e, "Failed to remove orphan");
                    result.errors.push(format!("{}: {}", container.id, e));
                }
            }
        }

        if result.removed > 0 {
            info!(
                "Orphan cleanup complete: removed {}/{} containers",
                result.removed, result.total_found
            );
        }

        result
    }

    /// Forget handles terminated before `cutoff`
    pub fn prune_terminated(&self, cutoff: DateTime<Utc>) -> usize {
        let mut handles = self.handles.write();
        let before = handles.len();
        handles.retain(|_, entry| {
            !matches!(entry.handle.terminated_at, Some(at) if at < cutoff)
        });
        before - handles.len()
    }

    pub fn summary(&self) -> HealthSummary {
        let handles = self.handles.read();
        let count = |status: ContainerStatus| {
            handles
                .values()
                .filter(|entry| entry.handle.status == status)
                .count()
        };

        HealthSummary {
            total: handles.len(),
            ready: count(ContainerStatus::Ready),
            unhealthy: count(ContainerStatus::Unhealthy),
            starting: count(ContainerStatus::Starting),
            errored: count(ContainerStatus::Error),
            terminated: count(ContainerStatus::Terminated),
        }
    }
}

/// Docker memory limit in bytes, saturating instead of wrapping
fn memory_bytes(memory_mb: u64) -> i64 {
    memory_mb
        .checked_mul(1024 * 1024)
        .and_then(|bytes| i64::try_from(bytes).ok())
        .unwrap_or(i64::MAX)
}

async fn remove_best_effort(runtime: &dyn ContainerRuntime, id_or_name: &str) {
    if let Err(e) = runtime.remove_container(id_or_name).await {
        warn!(container = %id_or_name, error = %e, "Failed to clean up container");
    }
}

type ProvisionReply = Result<(String, OwnedSemaphorePermit), ProvisioningError>;

/// Runtime half of `create`, detached from the caller
struct ProvisionTask {
    runtime: Arc<dyn ContainerRuntime>,
    in_flight: Arc<RwLock<HashSet<String>>>,
    create_timeout: Duration,
    session_id: SessionId,
    spec: ContainerSpec,
}

impl ProvisionTask {
    async fn run(self, permit: OwnedSemaphorePermit, reply: oneshot::Sender<ProvisionReply>) {
        let outcome = tokio::time::timeout(self.create_timeout, self.create_and_start()).await;
        let result = match outcome {
            Ok(Ok(container_id)) => Ok(container_id),
            Ok(Err(e)) => {
                warn!(
                    session_id = %self.session_id,
                    container_name = %self.spec.name,
                    error = %e,
                    "Container provisioning failed"
                );
                remove_best_effort(self.runtime.as_ref(), &self.spec.name).await;
                Err(e)
            }
            Err(_) => {
                warn!(
                    session_id = %self.session_id,
                    container_name = %self.spec.name,
                    timeout = ?self.create_timeout,
                    "Container provisioning timed out"
                );
                remove_best_effort(self.runtime.as_ref(), &self.spec.name).await;
                Err(ProvisioningError::Timeout(self.create_timeout))
            }
        };

        // Nobody is waiting for the container any more
        if let Err(Ok((container_id, _permit))) = reply.send(result.map(|id| (id, permit))) {
            warn!(
                session_id = %self.session_id,
                container_id = %container_id,
                "Provisioning caller went away, removing container"
            );
            remove_best_effort(self.runtime.as_ref(), &container_id).await;
        }

        self.in_flight.write().remove(&self.spec.name);
    }

    async fn create_and_start(&self) -> Result<String, ProvisioningError> {
        let container_id = self.runtime.create_container(&self.spec).await?;
        self.runtime.start_container(&container_id).await?;
        Ok(container_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRuntime;

    fn provisioner(runtime: &RecordingRuntime, max_active: usize) -> ContainerProvisioner {
        ContainerProvisioner::new(
            Arc::new(runtime.clone()),
            SandboxConfig::default(),
            Duration::from_secs(5),
            max_active,
        )
    }

    #[tokio::test]
    async fn test_create_applies_sandbox_limits_and_labels() {
        let runtime = RecordingRuntime::default();
        let provisioner = provisioner(&runtime, 4);
        let session_id = SessionId::new();

        let handle = provisioner.create(&session_id).await.expect("create succeeds");

        assert_eq!(handle.container_id, "c-1");
        assert_eq!(handle.status, ContainerStatus::Ready);
        assert_eq!(handle.limits.memory_bytes, 128 * 1024 * 1024);
        assert!(handle.name.starts_with(&format!("lab-{}-", session_id.short())));

        let spec = runtime.last_spec().expect("spec recorded");
        assert_eq!(spec.image, "net_explorerlearning-node");
        assert_eq!(spec.labels.get(LABEL_SESSION), Some(&session_id.to_string()));
        assert_eq!(spec.labels.get(LABEL_MANAGED).map(String::as_str), Some("true"));
        assert_eq!(provisioner.live_count_for(&session_id), 1);
    }

    #[tokio::test]
    async fn test_start_failure_removes_partial_container() {
        let runtime = RecordingRuntime::default();
        runtime.fail_next_start(ProvisioningError::Runtime("exec format error".into()));
        let provisioner = provisioner(&runtime, 4);

        let err = provisioner
            .create(&SessionId::new())
            .await
            .expect_err("start fails");

        assert!(matches!(err, ProvisioningError::Runtime(_)));
        assert_eq!(runtime.live_containers(), 0);
        assert!(runtime.operations().iter().any(|op| op.starts_with("remove:lab-")));
        assert_eq!(provisioner.available_slots(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_timeout_cleans_up_by_name() {
        let runtime = RecordingRuntime::default();
        runtime.set_start_delay(Duration::from_secs(30));
        let provisioner = provisioner(&runtime, 4);

        let err = provisioner
            .create(&SessionId::new())
            .await
            .expect_err("creation times out");

        assert_eq!(err, ProvisioningError::Timeout(Duration::from_secs(5)));
        assert_eq!(runtime.live_containers(), 0);
        assert!(provisioner.live_handles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_create_removes_container() {
        let runtime = RecordingRuntime::default();
        runtime.set_start_delay(Duration::from_secs(3));
        let provisioner = provisioner(&runtime, 1);

        let cancelled =
            tokio::time::timeout(Duration::from_secs(1), provisioner.create(&SessionId::new())).await;
        assert!(cancelled.is_err());
        assert_eq!(runtime.create_calls(), 1);

        // The detached task finishes starting, then removes what nobody claimed
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runtime.live_containers(), 0);
        assert!(provisioner.live_handles().is_empty());
        assert_eq!(provisioner.available_slots(), 1);
        assert!(provisioner.in_flight.read().is_empty());
    }

    #[test]
    fn test_memory_limit_saturates() {
        assert_eq!(memory_bytes(128), 128 * 1024 * 1024);
        assert_eq!(memory_bytes(u64::MAX), i64::MAX);
        assert_eq!(memory_bytes(u64::MAX / (1024 * 1024)), i64::MAX);
    }

    #[tokio::test]
    async fn test_capacity_limit_and_release() {
        let runtime = RecordingRuntime::default();
        let provisioner = provisioner(&runtime, 1);

        let first = provisioner.create(&SessionId::new()).await.unwrap();
        let err = provisioner
            .create(&SessionId::new())
            .await
            .expect_err("capacity exhausted");
        assert!(matches!(err, ProvisioningError::ResourceExhausted(_)));

        provisioner.destroy(&first.to_ref()).await;
        assert_eq!(provisioner.available_slots(), 1);
        assert!(provisioner.create(&SessionId::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let runtime = RecordingRuntime::default();
        let provisioner = provisioner(&runtime, 4);
        let handle = provisioner.create(&SessionId::new()).await.unwrap();

        provisioner.destroy(&handle.to_ref()).await;
        provisioner.destroy(&handle.to_ref()).await;

        assert_eq!(runtime.remove_calls(&handle.container_id), 1);
        assert_eq!(
            provisioner.handle(&handle.container_id).unwrap().status,
            ContainerStatus::Terminated
        );
    }

    #[tokio::test]
    async fn test_destroy_failure_is_swallowed() {
        let runtime = RecordingRuntime::default();
        let provisioner = provisioner(&runtime, 4);
        let handle = provisioner.create(&SessionId::new()).await.unwrap();

        runtime.fail_next_remove(ProvisioningError::RuntimeUnavailable("daemon gone".into()));
        provisioner.destroy(&handle.to_ref()).await;

        assert_eq!(
            provisioner.handle(&handle.container_id).unwrap().status,
            ContainerStatus::Error
        );

        // The reaper picks it up once the runtime is back
        let result = provisioner.reap_orphans().await;
        assert_eq!(result.removed, 1);
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_health_check_marks_unhealthy() {
        let runtime = RecordingRuntime::default();
        let provisioner = provisioner(&runtime, 4);
        let handle = provisioner.create(&SessionId::new()).await.unwrap();

        assert_eq!(provisioner.health_check(&handle.to_ref()).await, HealthStatus::Ready);

        runtime.set_running(&handle.container_id, false);
        assert_eq!(
            provisioner.health_check(&handle.to_ref()).await,
            HealthStatus::Unhealthy
        );
        assert_eq!(provisioner.summary().unhealthy, 1);
    }

    #[tokio::test]
    async fn test_reap_orphans_skips_owned_containers() {
        let runtime = RecordingRuntime::default();
        let provisioner = provisioner(&runtime, 4);
        let owned = provisioner.create(&SessionId::new()).await.unwrap();
        runtime.insert_orphan("lab-stale-0001", Some("old-session"));

        let result = provisioner.reap_orphans().await;

        assert_eq!(result.total_found, 1);
        assert_eq!(result.removed, 1);
        assert!(result.success());
        assert_eq!(runtime.live_containers(), 1);
        assert_eq!(runtime.remove_calls(&owned.container_id), 0);
    }

    #[tokio::test]
    async fn test_prune_terminated_handles() {
        let runtime = RecordingRuntime::default();
        let provisioner = provisioner(&runtime, 4);
        let handle = provisioner.create(&SessionId::new()).await.unwrap();
        provisioner.destroy(&handle.to_ref()).await;

        assert_eq!(provisioner.prune_terminated(Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(provisioner.prune_terminated(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert!(provisioner.handle(&handle.container_id).is_none());
    }
}

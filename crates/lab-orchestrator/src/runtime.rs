//! Container runtime abstraction
//!
//! The provisioner only needs a handful of primitives from whatever actually
//! runs containers. `DockerRuntime` implements them against the Docker daemon;
//! tests use the recording runtime from `testing`.

use crate::error::ProvisioningError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label carrying the owning session id
pub const LABEL_SESSION: &str = "lab.session";
/// Label marking containers this service manages
pub const LABEL_MANAGED: &str = "lab.managed";

/// Resource limits applied to every lab container
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    /// 1.0 = one CPU core
    pub cpu_cores: f64,
    /// Prevents fork bombs inside the sandbox
    pub pids_limit: i64,
}

/// Everything needed to create one sandbox container
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub limits: ResourceLimits,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
}

/// A lab-managed container as reported by the runtime
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub session_id: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ProvisioningError>;

    /// Start a created container
    async fn start_container(&self, container_id: &str) -> Result<(), ProvisioningError>;

    /// Force-remove a container by id or name. Missing containers are not an error.
    async fn remove_container(&self, id_or_name: &str) -> Result<(), ProvisioningError>;

    /// Check if a container is running. Missing containers report `false`.
    async fn is_running(&self, container_id: &str) -> Result<bool, ProvisioningError>;

    /// List every container carrying the managed label
    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>, ProvisioningError>;
}

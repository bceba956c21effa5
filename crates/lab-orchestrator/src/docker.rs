//! Docker client wrapper for lab containers
//!
//! Every container is created with hard memory/CPU/PID limits and tagged with
//! `lab.managed=true` plus the owning session id so stray containers can be
//! found and reaped after a crash or a timed-out creation.

use crate::error::ProvisioningError;
use crate::runtime::{ContainerRuntime, ContainerSpec, ManagedContainer, LABEL_MANAGED, LABEL_SESSION};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use std::collections::HashMap;
use tracing::{debug, info};

/// Networks Docker always provides; never created by us
const BUILTIN_NETWORKS: &[&str] = &["bridge", "host", "none"];

/// Docker-backed container runtime
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to Docker daemon
    pub async fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;

        // Verify connection
        docker.ping().await?;
        info!("Connected to Docker daemon");

        Ok(Self { docker })
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Ensure the lab network exists
    pub async fn ensure_network(&self, network_name: &str) -> anyhow::Result<()> {
        if BUILTIN_NETWORKS.contains(&network_name) {
            return Ok(());
        }

        let networks = self.docker.list_networks::<String>(None).await?;

        let exists = networks.iter().any(|n| {
            n.name
                .as_ref()
                .map(|name| name == network_name)
                .unwrap_or(false)
        });

        if !exists {
            use bollard::network::CreateNetworkOptions;

            let config = CreateNetworkOptions {
                name: network_name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            };

            self.docker.create_network(config).await?;
            info!(network = %network_name, "Created Docker network");
        } else {
            debug!(network = %network_name, "Docker network already exists");
        }

        Ok(())
    }
}

/// Map a Docker error onto the provisioning taxonomy
fn classify(err: bollard::errors::Error) -> ProvisioningError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => {
            let lower = message.to_lowercase();
            if lower.contains("no space")
                || lower.contains("out of memory")
                || lower.contains("cannot allocate")
                || lower.contains("insufficient")
            {
                ProvisioningError::ResourceExhausted(message)
            } else if status_code == 404 && lower.contains("image") {
                ProvisioningError::Runtime(format!("image not available: {}", message))
            } else {
                ProvisioningError::Runtime(format!("docker returned {}: {}", status_code, message))
            }
        }
        bollard::errors::Error::IOError { .. } | bollard::errors::Error::RequestTimeoutError => {
            ProvisioningError::RuntimeUnavailable(err.to_string())
        }
        other => ProvisioningError::Runtime(other.to_string()),
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ProvisioningError> {
        info!(
            image = %spec.image,
            container_name = %spec.name,
            "Creating lab container"
        );

        let host_config = HostConfig {
            network_mode: Some(spec.network.clone()),
            memory: Some(spec.limits.memory_bytes),
            // Disable swap so the memory limit is a hard cap
            memory_swap: Some(spec.limits.memory_bytes),
            nano_cpus: Some((spec.limits.cpu_cores * 1_000_000_000.0) as i64),
            pids_limit: Some(spec.limits.pids_limit),
            privileged: Some(false),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(classify)?;

        debug!(container_id = %response.id, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), ProvisioningError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)?;
        debug!(container_id = %container_id, "Container started");
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str) -> Result<(), ProvisioningError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(id_or_name, Some(options)).await {
            Ok(_) => {
                debug!(container = %id_or_name, "Container removed");
                Ok(())
            }
            // Already gone
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, ProvisioningError> {
        match self.docker.inspect_container(container_id, None).await {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>, ProvisioningError> {
        let managed_filter = format!("{}=true", LABEL_MANAGED);
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![managed_filter]);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let session_id = c
                    .labels
                    .and_then(|labels| labels.get(LABEL_SESSION).cloned());
                Some(ManagedContainer {
                    id,
                    name,
                    session_id,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_resource_exhaustion() {
        let err = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "no space left on device".into(),
        });
        assert!(matches!(err, ProvisioningError::ResourceExhausted(_)));
    }

    #[test]
    fn test_classify_missing_image() {
        let err = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such image: net_explorerlearning-node:latest".into(),
        });
        assert!(matches!(err, ProvisioningError::Runtime(ref m) if m.contains("image not available")));
    }

    #[test]
    fn test_not_found_detection() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(is_not_found(&err));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_docker_connect() {
        let runtime = DockerRuntime::connect().await;
        assert!(runtime.is_ok());
    }
}

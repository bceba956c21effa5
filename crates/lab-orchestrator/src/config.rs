//! Configuration types for the lab orchestrator
//!
//! `OrchestratorConfig` is serializable with human-friendly duration fields
//! (plain seconds) so it can be loaded from a TOML file and shared with
//! external tooling. Every policy knob (timeouts, session capacity, sandbox
//! limits, the checkpoint list) lives here rather than in constants.

use crate::error::{LabError, LabResult};
use crate::validation::{ValidatorRegistry, SUBNET_MASK};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest sandbox memory limit accepted (64 GiB)
pub const MAX_SANDBOX_MEMORY_MB: u64 = 64 * 1024;

/// Orchestrator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Sandbox container settings
    pub sandbox: SandboxConfig,
    /// Upper bound on container creation (create + start)
    #[serde(with = "humantime_serde")]
    pub create_timeout: Duration,
    /// Sessions without activity for this long are abandoned and reclaimed
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How often the idle sweep runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Container health check interval
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// How long finished sessions are remembered before being pruned
    #[serde(with = "humantime_serde")]
    pub tombstone_ttl: Duration,
    /// Maximum number of sessions holding a live container at once
    pub max_active_sessions: usize,
    /// Report archival settings
    pub archive: ArchiveConfig,
    /// Ordered checkpoints every session must pass
    pub checkpoints: Vec<CheckpointDefinition>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            create_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            tombstone_ttl: Duration::from_secs(24 * 60 * 60),
            max_active_sessions: 64,
            archive: ArchiveConfig::default(),
            checkpoints: vec![CheckpointDefinition::network_layer_subnet()],
        }
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document; missing fields fall back to defaults
    pub fn from_toml_str(raw: &str) -> LabResult<Self> {
        toml::from_str(raw).map_err(|e| LabError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> LabResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LabError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self, validators: &ValidatorRegistry) -> LabResult<()> {
        if self.checkpoints.is_empty() {
            return Err(LabError::Config("at least one checkpoint is required".into()));
        }
        for (index, checkpoint) in self.checkpoints.iter().enumerate() {
            if !validators.supports(&checkpoint.kind) {
                return Err(LabError::Config(format!(
                    "checkpoint {} ({}) uses unknown validator kind '{}'",
                    index, checkpoint.name, checkpoint.kind
                )));
            }
        }
        if self.create_timeout.is_zero() || self.archive.upload_timeout.is_zero() {
            return Err(LabError::Config("timeouts must be non-zero".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(LabError::Config("idle_timeout must be non-zero".into()));
        }
        if self.max_active_sessions == 0 {
            return Err(LabError::Config("max_active_sessions must be at least 1".into()));
        }
        if self.sandbox.memory_mb == 0 || self.sandbox.memory_mb > MAX_SANDBOX_MEMORY_MB {
            return Err(LabError::Config(format!(
                "sandbox memory_mb must be between 1 and {}",
                MAX_SANDBOX_MEMORY_MB
            )));
        }
        if self.sandbox.image.trim().is_empty() {
            return Err(LabError::Config("sandbox image must be set".into()));
        }
        Ok(())
    }
}

/// Per-session sandbox container settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image every lab container runs
    pub image: String,
    /// Docker network the container joins
    pub network_name: String,
    /// Prefix for generated container names
    pub name_prefix: String,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub pids_limit: i64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "net_explorerlearning-node".to_string(),
            network_name: "bridge".to_string(),
            name_prefix: "lab".to_string(),
            memory_mb: 128,
            cpu_cores: 0.5,
            pids_limit: 128,
        }
    }
}

/// Report archival settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Key prefix reports are stored under
    pub prefix: String,
    /// Version marker baked into the artifact key
    pub report_version: u32,
    /// Lab topology recorded in every report
    pub topology: String,
    #[serde(with = "humantime_serde")]
    pub upload_timeout: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            prefix: "reports".to_string(),
            report_version: 1,
            topology: "192.168.1.0/24".to_string(),
            upload_timeout: Duration::from_secs(30),
        }
    }
}

/// One gated exercise in a lab
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDefinition {
    pub name: String,
    /// OSI layer the exercise belongs to (1-7)
    pub layer: u8,
    /// Validator kind, looked up in the `ValidatorRegistry`
    pub kind: String,
    /// Expected value handed to the validator
    pub expected: String,
}

impl CheckpointDefinition {
    /// The stock layer 3 exercise: configure a /24 subnet mask
    pub fn network_layer_subnet() -> Self {
        Self {
            name: "network-layer subnet check".to_string(),
            layer: 3,
            kind: SUBNET_MASK.to_string(),
            expected: "255.255.255.0".to_string(),
        }
    }
}

/// Humantime serde helper
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

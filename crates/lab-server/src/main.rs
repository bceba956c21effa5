//! Lab Server - runs the networking lab orchestrator behind HTTP
//!
//! ```text
//! Lab Server (this)
//!  ├── Lab API (REST)        /start-lab /validate /complete-lab /session
//!  ├── History API           /history
//!  ├── Lab Orchestrator
//!  │   └── One Docker container per session
//!  │   └── Reports archived to disk or an HTTP object store
//!  └── Maintenance loops     idle sweep, container health
//! ```

use anyhow::Context;
use clap::Parser;
use lab_orchestrator::{
    FsObjectStore, HttpObjectStore, LabOrchestrator, ObjectStore, OrchestratorConfig,
};
use lab_server::{init_sentry, maintenance, router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lab-server")]
#[command(about = "Networking lab server - per-session sandboxes, checkpoint validation, report archival")]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "8080", env = "PORT")]
    port: u16,

    /// Server host
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    host: String,

    /// TOML file with orchestrator settings
    #[arg(short, long, env = "LAB_CONFIG")]
    config: Option<PathBuf>,

    /// Directory reports are archived to
    #[arg(long, default_value = "./lab-reports", env = "LAB_STORAGE_DIR")]
    storage_dir: PathBuf,

    /// Object store base URL; takes precedence over --storage-dir
    #[arg(long, env = "LAB_STORAGE_URL")]
    storage_url: Option<String>,

    /// Bearer token for the object store
    #[arg(long, env = "LAB_STORAGE_TOKEN", hide_env_values = true)]
    storage_token: Option<String>,

    /// Lab container image
    #[arg(long, env = "LAB_IMAGE")]
    image: Option<String>,

    /// Docker network lab containers join
    #[arg(long, env = "LAB_NETWORK")]
    network: Option<String>,

    /// Idle timeout before a session is reclaimed, in seconds
    #[arg(long, env = "LAB_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Maximum concurrently running lab containers
    #[arg(long, env = "LAB_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Sentry DSN; error tracking is off without one
    #[arg(long, env = "SENTRY_DSN", hide_env_values = true)]
    sentry_dsn: Option<String>,

    /// Environment name reported to Sentry
    #[arg(long, env = "LAB_ENVIRONMENT")]
    environment: Option<String>,
}

impl Args {
    /// File settings (or defaults) with command-line overrides applied
    fn orchestrator_config(&self) -> anyhow::Result<OrchestratorConfig> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => OrchestratorConfig::default(),
        };

        if let Some(image) = &self.image {
            config.sandbox.image = image.clone();
        }
        if let Some(network) = &self.network {
            config.sandbox.network_name = network.clone();
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_sessions {
            config.max_active_sessions = max;
        }

        Ok(config)
    }

    fn object_store(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        match &self.storage_url {
            Some(url) => {
                info!("  Report storage: {}", url);
                Ok(Arc::new(HttpObjectStore::new(
                    url.clone(),
                    self.storage_token.clone(),
                )?))
            }
            None => {
                info!("  Report storage: {}", self.storage_dir.display());
                Ok(Arc::new(FsObjectStore::new(self.storage_dir.clone())))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lab_server=debug".parse()?)
                .add_directive("lab_orchestrator=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let args = Args::parse();

    let _sentry_guard = init_sentry(args.sentry_dsn.as_deref(), args.environment.as_deref());
    if _sentry_guard.is_some() {
        info!("Sentry error tracking enabled");
    }

    let config = args.orchestrator_config()?;

    info!("Lab Server starting");
    info!("  Listening on: {}:{}", args.host, args.port);
    info!("  Lab image: {}", config.sandbox.image);
    info!(
        "  Idle timeout: {}s, max sessions: {}",
        config.idle_timeout.as_secs(),
        config.max_active_sessions
    );

    let store = args.object_store()?;
    let orchestrator = Arc::new(
        LabOrchestrator::connect_docker(config, store)
            .await
            .context("Docker is required to run lab containers")?,
    );

    // Containers left behind by a previous run
    let reaped = orchestrator.provisioner().reap_orphans().await;
    if reaped.removed > 0 {
        info!("  Removed {} stale lab containers", reaped.removed);
    }
    if !reaped.success() {
        warn!("  Stale container cleanup had {} errors", reaped.errors.len());
    }

    let tasks = maintenance::spawn(Arc::clone(&orchestrator));
    let app = router(Arc::new(AppState::new(Arc::clone(&orchestrator))));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server ready at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.abort();
    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, tearing down lab containers");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: &[&str] = &[
        "PORT",
        "HOST",
        "LAB_CONFIG",
        "LAB_STORAGE_DIR",
        "LAB_STORAGE_URL",
        "LAB_STORAGE_TOKEN",
        "LAB_IMAGE",
        "LAB_NETWORK",
        "LAB_IDLE_TIMEOUT_SECS",
        "LAB_MAX_SESSIONS",
        "SENTRY_DSN",
        "LAB_ENVIRONMENT",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_config_file() {
        clear_env();
        let args = Args::try_parse_from(["lab-server"]).unwrap();
        let config = args.orchestrator_config().unwrap();

        assert_eq!(args.port, 8080);
        assert_eq!(config.sandbox.image, "net_explorerlearning-node");
        assert_eq!(config.idle_timeout, Duration::from_secs(30 * 60));
    }

    #[test]
    #[serial]
    fn test_env_overrides_config_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.toml");
        std::fs::write(&path, "idle_timeout = 600\nmax_active_sessions = 8\n").unwrap();

        std::env::set_var("LAB_CONFIG", &path);
        std::env::set_var("LAB_MAX_SESSIONS", "2");
        std::env::set_var("LAB_IMAGE", "lab-node:test");
        let args = Args::try_parse_from(["lab-server"]).unwrap();
        let config = args.orchestrator_config().unwrap();
        clear_env();

        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.max_active_sessions, 2);
        assert_eq!(config.sandbox.image, "lab-node:test");
    }

    #[test]
    #[serial]
    fn test_missing_config_file_is_an_error() {
        clear_env();
        let args =
            Args::try_parse_from(["lab-server", "--config", "/nonexistent/lab.toml"]).unwrap();
        let err = args.orchestrator_config().unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/lab.toml"));
    }
}

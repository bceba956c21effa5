//! Background maintenance loops
//!
//! Two independent loops run for the life of the server: the idle sweep
//! (reclaims abandoned sessions, prunes tombstones, reaps orphaned
//! containers) and the container health monitor. Both report the sessions
//! they touched to the audit trail.

use crate::observability::{AuditEntry, AuditEventType, AuditLogger};
use lab_orchestrator::LabOrchestrator;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct MaintenanceTasks {
    sweeper: JoinHandle<()>,
    health: JoinHandle<()>,
}

impl MaintenanceTasks {
    pub fn abort(&self) {
        self.sweeper.abort();
        self.health.abort();
    }
}

impl Drop for MaintenanceTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Run one idle sweep and audit every reclaimed session
pub async fn run_sweep(orchestrator: &LabOrchestrator) {
    let report = orchestrator.sweep().await;

    for session_id in &report.abandoned {
        AuditLogger::log(
            &AuditEntry::new(AuditEventType::SessionAbandoned).session(session_id.as_str()),
        );
    }
    for error in &report.orphans.errors {
        warn!(error = %error, "Orphan cleanup error");
    }

    if report.abandoned.is_empty() && report.orphans.removed == 0 {
        debug!(pruned = report.pruned_sessions, "Session sweep finished");
    } else {
        info!(
            abandoned = report.abandoned.len(),
            pruned_sessions = report.pruned_sessions,
            pruned_handles = report.pruned_handles,
            orphans = report.orphans.removed,
            "Session sweep finished"
        );
    }
}

/// Run one health pass and audit every session that lost its container
pub async fn run_health_check(orchestrator: &LabOrchestrator) {
    let report = orchestrator.check_health().await;
    for session_id in &report.lost {
        AuditLogger::log(
            &AuditEntry::new(AuditEventType::SessionFailed)
                .session(session_id.as_str())
                .failed("container lost"),
        );
    }
}

pub fn spawn(orchestrator: Arc<LabOrchestrator>) -> MaintenanceTasks {
    let sweep_every = orchestrator.config().sweep_interval;
    let check_every = orchestrator.config().health_check_interval;

    let sweep_orchestrator = Arc::clone(&orchestrator);
    let sweeper = tokio::spawn(async move {
        let mut ticker = interval(sweep_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_sweep(&sweep_orchestrator).await;
        }
    });

    let health = tokio::spawn(async move {
        let mut ticker = interval(check_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_health_check(&orchestrator).await;
        }
    });

    MaintenanceTasks { sweeper, health }
}

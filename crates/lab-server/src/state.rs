//! Application state

use lab_orchestrator::LabOrchestrator;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub orchestrator: Arc<LabOrchestrator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<LabOrchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

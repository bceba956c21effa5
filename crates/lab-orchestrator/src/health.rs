//! Health reporting for lab containers

use crate::session::SessionId;
use serde::Serialize;

/// Counts of provisioner handles by status
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub ready: usize,
    pub unhealthy: usize,
    pub starting: usize,
    /// Teardown failed, waiting for the reaper
    pub errored: usize,
    pub terminated: usize,
}

impl HealthSummary {
    /// Containers that still hold a capacity slot
    pub fn live(&self) -> usize {
        self.ready + self.unhealthy + self.starting
    }

    pub fn all_healthy(&self) -> bool {
        self.unhealthy == 0 && self.errored == 0
    }

    pub fn percentage_healthy(&self) -> f64 {
        let live = self.live();
        if live == 0 {
            100.0
        } else {
            (self.ready as f64 / live as f64) * 100.0
        }
    }
}

/// Outcome of one health pass over running sessions
#[derive(Clone, Debug, Default, Serialize)]
pub struct HealthCheckReport {
    pub checked: usize,
    /// Sessions failed because their container disappeared
    pub lost: Vec<SessionId>,
}

//! Probe outcomes and the scoring rule.

use tidepool_core::{ConnectionId, HealthScore, HealthSettings};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// Ping and probe statement both succeeded.
    Passed,
    /// Ping failed or the probe statement errored.
    Failed,
}

impl From<bool> for ProbeResult {
    fn from(passed: bool) -> Self {
        if passed {
            ProbeResult::Passed
        } else {
            ProbeResult::Failed
        }
    }
}

/// Apply a probe result to a score. Bounded to [0, 100].
pub fn rescore(score: HealthScore, result: ProbeResult, settings: &HealthSettings) -> HealthScore {
    match result {
        ProbeResult::Passed => score.recover(settings.recovery_step),
        ProbeResult::Failed => score.penalize(settings.penalty_step),
    }
}

/// Summary of one probe sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub passed: usize,
    pub failed: usize,
    /// Connections recycled for falling to or below the threshold.
    pub recycled: Vec<ConnectionId>,
    /// Connections opened to restore `min_connections`.
    pub replenished: usize,
}

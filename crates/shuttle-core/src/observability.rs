use serde::{Deserialize, Serialize};

use crate::domain::Resolution;

/// Per-supervisor tallies of how deliveries were settled.
///
/// Shared by every poll loop behind a mutex; read with
/// `WorkerSupervisor::counts()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounts {
    pub accepted: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub discarded: u64,
    pub dropped: u64,
    pub fetch_errors: u64,
}

impl PipelineCounts {
    pub fn record(&mut self, resolution: &Resolution) {
        let slot = match resolution {
            Resolution::Accepted => &mut self.accepted,
            Resolution::Duplicate => &mut self.duplicates,
            Resolution::Retried { .. } => &mut self.retried,
            Resolution::RetryExceeded => &mut self.exhausted,
            Resolution::Discarded => &mut self.discarded,
            Resolution::Dropped => &mut self.dropped,
        };
        *slot += 1;
    }

    /// Deliveries that reached a resolution (fetch errors excluded).
    pub fn processed(&self) -> u64 {
        self.accepted
            + self.duplicates
            + self.retried
            + self.exhausted
            + self.discarded
            + self.dropped
    }
}

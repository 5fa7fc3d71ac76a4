use crate::job::JobStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Point-in-time job counts for one queue.
///
/// A best-effort snapshot: counts are read per status without a
/// transaction, so a job settling mid-read may be counted under either
/// side of its transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    /// Lapsed leases observed since the store was opened.
    pub stalled: u64,
}

impl QueueStats {
    pub(crate) fn from_counts(counts: HashMap<JobStatus, u64>, stalled: u64) -> Self {
        let get = |s: JobStatus| counts.get(&s).copied().unwrap_or(0);
        Self {
            waiting: get(JobStatus::Waiting),
            active: get(JobStatus::Active),
            completed: get(JobStatus::Completed),
            failed: get(JobStatus::Failed),
            delayed: get(JobStatus::Delayed),
            stalled,
        }
    }

    /// Jobs that have not yet reached a terminal status.
    pub fn pending(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }

    pub fn total(&self) -> u64 {
        self.pending() + self.completed + self.failed
    }
}

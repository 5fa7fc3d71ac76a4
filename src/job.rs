use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job, assigned at enqueue time.
pub type JobId = Uuid;

/// Lifecycle status of a job.
///
/// `Completed` and `Failed` are terminal; no further transition is
/// permitted once a job reaches either.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible for leasing by a worker slot.
    Waiting,
    /// Leased and currently executing.
    Active,
    /// Finished successfully.
    Completed,
    /// Exhausted all attempts.
    Failed,
    /// Not eligible before `delay_until` (scheduled job or retry backoff).
    Delayed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Delayed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Waiting => matches!(next, JobStatus::Active | JobStatus::Delayed),
            JobStatus::Delayed => matches!(next, JobStatus::Waiting | JobStatus::Active),
            JobStatus::Active => !matches!(next, JobStatus::Active),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental progress reported by the handler holding a job's lease.
///
/// Advisory only. The percentage is clamped to 0..=100 and never moves
/// backwards within one attempt; it resets when the job is re-claimed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub percentage: u8,
    pub message: String,
}

impl Progress {
    pub fn new(percentage: u8, message: impl Into<String>) -> Self {
        Self {
            percentage: percentage.min(100),
            message: message.into(),
        }
    }
}

/// A unit of asynchronous work and its full lifecycle state.
///
/// The store, not any in-process copy, is the source of truth: workers
/// mutate a job only through the store's atomic primitives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Named queue this job belongs to.
    pub queue: String,
    /// Type tag selecting the registered handler.
    pub kind: String,
    /// Producer-owned data, opaque to the queue.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Execution attempts so far. Incremented on every claim, including
    /// reclaims of stalled leases.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Higher runs first; ties break FIFO by `created_at`.
    pub priority: i32,
    pub progress: Option<Progress>,
    /// Set exactly once, on terminal success.
    pub result: Option<serde_json::Value>,
    /// Set on terminal failure; also records the last retryable error.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Job is not eligible for leasing before this time.
    pub delay_until: Option<DateTime<Utc>>,
    /// Most recent lease acquisition time.
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Current lease, present only while `Active`.
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => true,
            JobStatus::Delayed => self.delay_until.map_or(true, |t| t <= now),
            _ => false,
        }
    }

    /// Whether an `Active` job's lease has lapsed (the job stalled).
    pub fn lease_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active
            && self.lease_expires_at.map_or(true, |t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn terminal_statuses_admit_no_transition() {
        for next in JobStatus::ALL {
            assert!(!JobStatus::Completed.can_transition_to(next));
            assert!(!JobStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn waiting_cannot_jump_to_terminal() {
        assert!(!JobStatus::Waiting.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Waiting.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Waiting.can_transition_to(JobStatus::Active));
    }

    #[test]
    fn progress_percentage_is_clamped() {
        assert_eq!(Progress::new(250, "overflow").percentage, 100);
        assert_eq!(Progress::new(100, "done").percentage, 100);
        assert_eq!(Progress::new(0, "start").percentage, 0);
    }

    proptest! {
        /// Every reachable transition target is one of the five defined
        /// states, and nothing escapes a terminal state.
        #[test]
        fn prop_state_machine_closed(from_idx in 0usize..5, to_idx in 0usize..5) {
            let from = JobStatus::ALL[from_idx];
            let to = JobStatus::ALL[to_idx];
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
            if from.can_transition_to(to) {
                prop_assert!(JobStatus::ALL.contains(&to));
            }
        }
    }
}

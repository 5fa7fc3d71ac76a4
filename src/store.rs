use crate::error::Result;
use crate::job::{Job, JobId, JobStatus, Progress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

/// Outcome of a conditional status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The lease no longer matches or the status moved underneath us.
    /// Workers map this to a stall.
    Conflict,
}

/// Fields written alongside a status transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub delay_until: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn completed(result: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            result: Some(result),
            finished_at: Some(now),
            ..Self::default()
        }
    }

    pub fn failed(error: String, now: DateTime<Utc>) -> Self {
        Self {
            error: Some(error),
            finished_at: Some(now),
            ..Self::default()
        }
    }

    pub fn retry(error: String, delay_until: DateTime<Utc>) -> Self {
        Self {
            error: Some(error),
            delay_until: Some(delay_until),
            ..Self::default()
        }
    }
}

/// Durable storage for job records.
///
/// `claim_next` is the correctness-critical operation: across any number
/// of processes sharing one store, at most one caller may receive a given
/// claim. Everything else in the queue leans on that atomicity; no
/// in-process lock can substitute for it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job record. One durable write.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Atomically claim the next eligible job of `kind` on `queue`.
    ///
    /// Eligibility is `(priority desc, created_at asc)` among jobs that
    /// are `Waiting`, or `Delayed` with `delay_until <= now`. Implementors
    /// must also sweep lapsed leases first: a stalled `Active` job either
    /// becomes claimable again or, with attempts exhausted, terminally
    /// `Failed` — the sweep increments the stall counter either way.
    ///
    /// A successful claim transitions the job to `Active`, increments
    /// `attempts`, clears `progress`, stamps `processed_at`, and attaches
    /// a fresh lease expiring after `lease_ttl`.
    async fn claim_next(&self, queue: &str, kind: &str, lease_ttl: Duration)
        -> Result<Option<Job>>;

    /// Conditionally transition a job, guarded by the caller's lease and
    /// the expected current status.
    async fn update_status(
        &self,
        id: JobId,
        lease: Uuid,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusUpdate,
    ) -> Result<TransitionOutcome>;

    /// Lease-checked progress write. Returns `false` (without error) when
    /// the lease is no longer held or the percentage would move backwards.
    async fn write_progress(&self, id: JobId, lease: Uuid, progress: Progress) -> Result<bool>;

    /// Point-in-time job counts per status for `queue`. Best effort.
    async fn count_by_status(&self, queue: &str) -> Result<HashMap<JobStatus, u64>>;

    /// Fetch one job record.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Total lapsed leases observed on `queue` since the store was opened.
    async fn stalled_total(&self, queue: &str) -> Result<u64>;
}

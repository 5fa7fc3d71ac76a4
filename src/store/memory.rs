use super::{JobStore, StatusUpdate, TransitionOutcome};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobStatus, Progress};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// In-memory job store (not persistent; for tests and development).
///
/// Claims and conditional transitions run under one mutex, which models
/// the atomicity the `JobStore` contract demands of real backends.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    stalled: HashMap<String, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Store("lock poisoned".to_string()))
    }

    /// Move lapsed leases out of `Active`: back to `Waiting` while
    /// attempts remain, terminally `Failed` otherwise. Counts a stall
    /// either way. The consumed attempt was already charged at claim
    /// time, so a reclaimed job is eligible again immediately.
    fn sweep_lapsed(state: &mut State, queue: &str, now: chrono::DateTime<chrono::Utc>) {
        let mut stalls = 0u64;
        for job in state.jobs.values_mut() {
            if job.queue == queue && job.lease_lapsed(now) {
                stalls += 1;
                job.lease_token = None;
                job.lease_expires_at = None;
                if job.attempts >= job.max_attempts {
                    job.status = JobStatus::Failed;
                    job.error = Some(format!("lease expired on attempt {}", job.attempts));
                    job.finished_at = Some(now);
                } else {
                    job.status = JobStatus::Waiting;
                    job.delay_until = None;
                    job.error = Some(format!("lease expired on attempt {}", job.attempts));
                }
                tracing::warn!(job_id = %job.id, attempts = job.attempts, "stalled job reclaimed");
            }
        }
        if stalls > 0 {
            *state.stalled.entry(queue.to_string()).or_insert(0) += stalls;
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let mut state = self.lock()?;
        state.jobs.insert(job.id, job);
        Ok(())
    }

    async fn claim_next(
        &self,
        queue: &str,
        kind: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut state = self.lock()?;
        Self::sweep_lapsed(&mut state, queue, now);

        let candidate = state
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.kind == kind && j.is_eligible(now))
            // highest priority first, then oldest
            .min_by_key(|j| (std::cmp::Reverse(j.priority), j.created_at))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let ttl = chrono::Duration::from_std(lease_ttl)
            .map_err(|e| QueueError::Store(e.to_string()))?;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        job.status = JobStatus::Active;
        job.attempts += 1;
        job.progress = None;
        job.processed_at = Some(now);
        job.lease_token = Some(Uuid::new_v4());
        job.lease_expires_at = Some(now + ttl);
        Ok(Some(job.clone()))
    }

    async fn update_status(
        &self,
        id: JobId,
        lease: Uuid,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusUpdate,
    ) -> Result<TransitionOutcome> {
        let mut state = self.lock()?;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(TransitionOutcome::Conflict);
        };
        if job.status != expected
            || job.lease_token != Some(lease)
            || !expected.can_transition_to(new)
        {
            return Ok(TransitionOutcome::Conflict);
        }
        job.status = new;
        if let Some(result) = fields.result {
            job.result = Some(result);
        }
        if let Some(error) = fields.error {
            job.error = Some(error);
        }
        job.delay_until = fields.delay_until;
        if let Some(finished_at) = fields.finished_at {
            job.finished_at = Some(finished_at);
        }
        if new != JobStatus::Active {
            job.lease_token = None;
            job.lease_expires_at = None;
        }
        Ok(TransitionOutcome::Applied)
    }

    async fn write_progress(&self, id: JobId, lease: Uuid, progress: Progress) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Active || job.lease_token != Some(lease) {
            return Ok(false);
        }
        if let Some(current) = &job.progress {
            if progress.percentage < current.percentage {
                return Ok(false);
            }
        }
        job.progress = Some(progress);
        Ok(true)
    }

    async fn count_by_status(&self, queue: &str) -> Result<HashMap<JobStatus, u64>> {
        let state = self.lock()?;
        let mut counts: HashMap<JobStatus, u64> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for job in state.jobs.values() {
            if job.queue == queue {
                *counts.entry(job.status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let state = self.lock()?;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn stalled_total(&self, queue: &str) -> Result<u64> {
        let state = self.lock()?;
        Ok(state.stalled.get(queue).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(queue: &str, kind: &str, priority: i32) -> Job {
        Job {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            kind: kind.to_string(),
            payload: json!({}),
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: 3,
            priority,
            progress: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            delay_until: None,
            processed_at: None,
            finished_at: None,
            lease_token: None,
            lease_expires_at: None,
        }
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let store = MemoryStore::new();
        let low = job("q", "k", 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let high = job("q", "k", 5);
        store.enqueue(low.clone()).await.unwrap();
        store.enqueue(high.clone()).await.unwrap();

        let first = store
            .claim_next("q", "k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, high.id);

        let second = store
            .claim_next("q", "k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    async fn claim_charges_an_attempt_and_attaches_a_lease() {
        let store = MemoryStore::new();
        store.enqueue(job("q", "k", 0)).await.unwrap();

        let claimed = store
            .claim_next("q", "k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.lease_token.is_some());
        assert!(claimed.processed_at.is_some());

        // The one eligible job is now leased.
        let none = store
            .claim_next("q", "k", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn lapsed_lease_is_reclaimable_and_counted() {
        let store = MemoryStore::new();
        store.enqueue(job("q", "k", 0)).await.unwrap();

        let first = store
            .claim_next("q", "k", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = store
            .claim_next("q", "k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);
        assert_ne!(second.lease_token, first.lease_token);
        assert_eq!(store.stalled_total("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lapsed_lease_with_exhausted_attempts_fails_terminally() {
        let store = MemoryStore::new();
        let mut j = job("q", "k", 0);
        j.max_attempts = 1;
        let id = j.id;
        store.enqueue(j).await.unwrap();

        store
            .claim_next("q", "k", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Sweep runs on the next claim.
        let none = store
            .claim_next("q", "k", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(none.is_none());

        let failed = store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.is_some());
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn stale_lease_cannot_transition() {
        let store = MemoryStore::new();
        store.enqueue(job("q", "k", 0)).await.unwrap();

        let claimed = store
            .claim_next("q", "k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let outcome = store
            .update_status(
                claimed.id,
                Uuid::new_v4(), // not the holder's token
                JobStatus::Active,
                JobStatus::Completed,
                StatusUpdate::completed(json!(null), Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Conflict);

        let job = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn progress_is_lease_checked_and_monotonic() {
        let store = MemoryStore::new();
        store.enqueue(job("q", "k", 0)).await.unwrap();
        let claimed = store
            .claim_next("q", "k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let lease = claimed.lease_token.unwrap();

        assert!(store
            .write_progress(claimed.id, lease, Progress::new(40, "step 2"))
            .await
            .unwrap());
        // Regressions are dropped.
        assert!(!store
            .write_progress(claimed.id, lease, Progress::new(10, "step 1"))
            .await
            .unwrap());
        // A stranger's token writes nothing.
        assert!(!store
            .write_progress(claimed.id, Uuid::new_v4(), Progress::new(90, "nope"))
            .await
            .unwrap());

        let job = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.progress.unwrap().percentage, 40);
    }
}

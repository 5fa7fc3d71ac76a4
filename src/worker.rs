use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::handler::{ErasedHandler, JobContext};
use crate::job::{Job, JobStatus};
use crate::queue::{EventRegistry, JobEvent};
use crate::retry::{on_failure, RetryDecision};
use crate::store::{JobStore, StatusUpdate, TransitionOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

/// Bounded set of concurrent execution slots for one job kind.
///
/// Each slot is an independent tokio task looping
/// `idle -> leasing -> executing -> settle`. The concurrency bound is
/// exact: a slot holds at most one claim at a time, so at most
/// `concurrency` handler invocations of this kind are ever in flight
/// from this pool.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    pub(crate) fn start(
        queue: String,
        kind: String,
        handler: Arc<dyn ErasedHandler>,
        concurrency: usize,
        store: Arc<dyn JobStore>,
        config: QueueConfig,
        events: Arc<EventRegistry>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = concurrency.max(1);
        let mut handles = Vec::with_capacity(concurrency);
        for slot in 0..concurrency {
            let slot = Slot {
                queue: queue.clone(),
                kind: kind.clone(),
                slot,
                handler: Arc::clone(&handler),
                store: Arc::clone(&store),
                config: config.clone(),
                events: Arc::clone(&events),
                shutdown: shutdown_rx.clone(),
            };
            handles.push(tokio::spawn(slot.run()));
        }
        Self {
            handles,
            shutdown_tx,
        }
    }

    /// Stop leasing. In-flight claims finish under the handler they
    /// started with.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn abort_handles(&self) -> Vec<AbortHandle> {
        self.handles.iter().map(|h| h.abort_handle()).collect()
    }

    pub(crate) fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

struct Slot {
    queue: String,
    kind: String,
    slot: usize,
    handler: Arc<dyn ErasedHandler>,
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    events: Arc<EventRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl Slot {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self
                .store
                .claim_next(&self.queue, &self.kind, self.config.lease_ttl)
                .await
            {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => self.idle(self.config.poll_interval).await,
                Err(e) => {
                    // Store trouble during leasing never kills the pool.
                    tracing::error!(
                        queue = %self.queue,
                        kind = %self.kind,
                        slot = self.slot,
                        error = %e,
                        "claim failed, backing off"
                    );
                    self.idle(self.config.claim_backoff).await;
                }
            }
        }
        tracing::debug!(queue = %self.queue, kind = %self.kind, slot = self.slot, "slot stopped");
    }

    /// Sleep, waking early on shutdown.
    async fn idle(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn execute(&self, job: Job) {
        let Some(lease) = job.lease_token else {
            tracing::error!(job_id = %job.id, "claim returned a job without a lease");
            return;
        };
        tracing::debug!(
            job_id = %job.id,
            kind = %self.kind,
            attempt = job.attempts,
            slot = self.slot,
            "executing"
        );
        self.events.emit(&JobEvent::Started {
            job_id: job.id,
            kind: job.kind.clone(),
            attempt: job.attempts,
        });

        let ctx = JobContext::new(
            job.id,
            job.queue.clone(),
            job.attempts,
            job.created_at,
            Arc::clone(&self.store),
            lease,
        );
        // The handler runs in its own task so a panic is contained and
        // settles the job like any other failure.
        let handler = Arc::clone(&self.handler);
        let payload = job.payload.clone();
        let invocation = tokio::spawn(async move { handler.handle(ctx, payload).await });
        let overrun_abort = invocation.abort_handle();

        let outcome = match tokio::time::timeout(self.config.lease_ttl, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(QueueError::Handler(format!(
                "handler panicked: {join_err}"
            ))),
            Err(_) => {
                // Stop the overrunning invocation before this slot moves
                // on, or the concurrency bound would briefly be exceeded.
                overrun_abort.abort();
                Err(QueueError::Handler(format!(
                    "handler exceeded lease of {:?}",
                    self.config.lease_ttl
                )))
            }
        };

        match outcome {
            Ok(result) => self.settle_success(&job, lease, result).await,
            Err(e) => self.settle_failure(&job, lease, e).await,
        }
    }

    async fn settle_success(&self, job: &Job, lease: uuid::Uuid, result: serde_json::Value) {
        let now = Utc::now();
        match self
            .store
            .update_status(
                job.id,
                lease,
                JobStatus::Active,
                JobStatus::Completed,
                StatusUpdate::completed(result, now),
            )
            .await
        {
            Ok(TransitionOutcome::Applied) => {
                tracing::debug!(job_id = %job.id, attempt = job.attempts, "completed");
                self.events.emit(&JobEvent::Completed { job_id: job.id });
            }
            Ok(TransitionOutcome::Conflict) => self.observe_stall(job),
            Err(e) => {
                // The result is lost; the lease will lapse and the job be
                // retried elsewhere.
                tracing::error!(job_id = %job.id, error = %e, "failed to record completion");
            }
        }
    }

    async fn settle_failure(&self, job: &Job, lease: uuid::Uuid, error: QueueError) {
        let now = Utc::now();
        let (new_status, fields, event) =
            match on_failure(&self.config.retry, job.attempts, job.max_attempts) {
                RetryDecision::RetryAfter(delay) => {
                    let delay_until = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(0));
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        retry_in = ?delay,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    (
                        JobStatus::Delayed,
                        StatusUpdate::retry(error.to_string(), delay_until),
                        JobEvent::Retried {
                            job_id: job.id,
                            attempt: job.attempts,
                            delay,
                        },
                    )
                }
                RetryDecision::Fail => {
                    tracing::warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %error,
                        "attempts exhausted, failing terminally"
                    );
                    (
                        JobStatus::Failed,
                        StatusUpdate::failed(error.to_string(), now),
                        JobEvent::Failed {
                            job_id: job.id,
                            attempts: job.attempts,
                        },
                    )
                }
            };

        match self
            .store
            .update_status(job.id, lease, JobStatus::Active, new_status, fields)
            .await
        {
            Ok(TransitionOutcome::Applied) => self.events.emit(&event),
            Ok(TransitionOutcome::Conflict) => self.observe_stall(job),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to record failure");
            }
        }
    }

    /// The lease moved underneath us: another slot reclaimed the job.
    /// Whatever we were about to record is advisory history now.
    fn observe_stall(&self, job: &Job) {
        tracing::warn!(job_id = %job.id, attempt = job.attempts, "lease lost before settle");
        self.events.emit(&JobEvent::Stalled { job_id: job.id });
    }
}

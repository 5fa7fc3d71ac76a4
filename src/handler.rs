use crate::error::Result;
use crate::job::{JobId, Progress};
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

/// Context passed to a handler for one execution attempt.
///
/// Carries the progress-reporting capability bound to the attempt's lease;
/// a context outliving its lease can still be called, but its writes are
/// silently dropped.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    /// 1-based attempt number for this execution.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    reporter: ProgressReporter,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        queue: String,
        attempt: u32,
        created_at: DateTime<Utc>,
        store: Arc<dyn JobStore>,
        lease: Uuid,
    ) -> Self {
        Self {
            job_id,
            queue,
            attempt,
            created_at,
            reporter: ProgressReporter { store, job_id, lease },
        }
    }

    /// Publish incremental progress against this job's record.
    ///
    /// Advisory: if the lease behind this context has lapsed the write is
    /// ignored and `Ok(())` is still returned. Only store connectivity
    /// failures surface as errors.
    pub async fn report_progress(&self, percentage: u8, message: impl Into<String>) -> Result<()> {
        self.reporter.report(Progress::new(percentage, message)).await
    }
}

impl Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Lease-bound progress side channel.
#[derive(Clone)]
struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    lease: Uuid,
}

impl ProgressReporter {
    async fn report(&self, progress: Progress) -> Result<()> {
        let applied = self
            .store
            .write_progress(self.job_id, self.lease, progress)
            .await?;
        if !applied {
            tracing::debug!(job_id = %self.job_id, "progress ignored: lease no longer held");
        }
        Ok(())
    }
}

/// A handler for one job kind.
///
/// Failure is signalled by returning an error; the worker pool routes it
/// to the retry policy, so a handler error never propagates to producers.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// The job kind this handler processes.
    const KIND: &'static str;

    /// Payload type, deserialized from the stored job record.
    type Data: Serialize + DeserializeOwned + Send + Sync + Debug;

    /// Value stored on the job record on terminal success.
    type Output: Serialize + Send + Sync;

    async fn run(&self, ctx: JobContext, data: Self::Data) -> Result<Self::Output>;
}

/// Type-erased handler, stored in the queue's registry.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, payload: serde_json::Value)
        -> Result<serde_json::Value>;
}

#[async_trait]
impl<H: JobHandler> ErasedHandler for H {
    async fn handle(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let data: H::Data = serde_json::from_value(payload)?;
        let output = self.run(ctx, data).await?;
        Ok(serde_json::to_value(output)?)
    }
}

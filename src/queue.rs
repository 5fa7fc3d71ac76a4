use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::handler::JobHandler;
use crate::job::{Job, JobId, JobStatus, Progress};
use crate::stats::QueueStats;
use crate::store::JobStore;
use crate::worker::WorkerPool;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Options for enqueueing a job.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Hold the job in `Delayed` until this much time has passed.
    pub delay: Option<Duration>,
    /// Higher runs first; ties are FIFO. Default 0.
    pub priority: i32,
    /// Per-job override of the queue's retry ceiling.
    pub max_attempts: Option<u32>,
}

impl AddOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    pub fn priority(mut self, p: i32) -> Self {
        self.priority = p;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n.max(1));
        self
    }
}

/// Notification emitted after a job's state transition.
///
/// Delivered to callbacks registered with [`Queue::on_event`]; an explicit
/// registry, decoupled from the transition logic itself.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Enqueued { job_id: JobId, kind: String },
    Started { job_id: JobId, kind: String, attempt: u32 },
    Completed { job_id: JobId },
    Retried { job_id: JobId, attempt: u32, delay: Duration },
    Failed { job_id: JobId, attempts: u32 },
    Stalled { job_id: JobId },
}

type EventCallback = Box<dyn Fn(&JobEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventRegistry {
    callbacks: RwLock<Vec<EventCallback>>,
}

impl EventRegistry {
    pub(crate) fn emit(&self, event: &JobEvent) {
        if let Ok(callbacks) = self.callbacks.read() {
            for cb in callbacks.iter() {
                cb(event);
            }
        }
    }

    fn register(&self, cb: EventCallback) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push(cb);
        }
    }
}

/// A named, durable job queue.
///
/// Producers [`add`](Queue::add) typed payloads; consumers register a
/// handler per job kind with [`process`](Queue::process), each backed by a
/// bounded pool of worker slots. The store, not this instance, is the
/// source of truth: any number of `Queue` instances (in any number of
/// processes) sharing a store observe the same job set.
///
/// # Example
///
/// ```rust,no_run
/// use workq::{AddOptions, Job, JobContext, JobHandler, MemoryStore, Queue, Result};
/// use async_trait::async_trait;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Search { query: String }
///
/// #[derive(Clone)]
/// struct SearchHandler;
///
/// #[async_trait]
/// impl JobHandler for SearchHandler {
///     const KIND: &'static str = "search";
///     type Data = Search;
///     type Output = u64;
///
///     async fn run(&self, ctx: JobContext, data: Search) -> Result<u64> {
///         ctx.report_progress(50, format!("searching {}", data.query)).await?;
///         Ok(42)
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let queue = Queue::new("default", MemoryStore::new());
///     queue.process(SearchHandler, 4)?;
///     queue.add::<SearchHandler>(Search { query: "art grants".into() }).await?;
///     queue.close().await
/// }
/// ```
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    pools: Mutex<Pools>,
    events: Arc<EventRegistry>,
    closed: AtomicBool,
}

#[derive(Default)]
struct Pools {
    active: HashMap<String, WorkerPool>,
    /// Pools replaced by re-registration; they drain in the background
    /// and are still awaited on close.
    retired: Vec<WorkerPool>,
}

impl Queue {
    pub fn new<S: JobStore + 'static>(name: impl Into<String>, store: S) -> Self {
        Self::with_config(name, store, QueueConfig::default())
    }

    pub fn with_config<S: JobStore + 'static>(
        name: impl Into<String>,
        store: S,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                store: Arc::new(store),
                config,
                pools: Mutex::new(Pools::default()),
                events: Arc::new(EventRegistry::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a job with default options.
    pub async fn add<H: JobHandler>(&self, data: H::Data) -> Result<Job> {
        self.add_with::<H>(data, AddOptions::default()).await
    }

    /// Enqueue a job. One durable write; never blocks on a handler.
    pub async fn add_with<H: JobHandler>(&self, data: H::Data, opts: AddOptions) -> Result<Job> {
        self.add_raw(H::KIND, serde_json::to_value(data)?, opts).await
    }

    /// Enqueue a pre-serialized payload under an arbitrary kind tag.
    pub async fn add_raw(
        &self,
        kind: &str,
        payload: serde_json::Value,
        opts: AddOptions,
    ) -> Result<Job> {
        self.ensure_open()?;
        if kind.trim().is_empty() {
            return Err(QueueError::Validation("job kind must be non-empty".into()));
        }

        let now = Utc::now();
        let (status, delay_until) = match opts.delay {
            Some(d) if !d.is_zero() => {
                let until = now
                    + chrono::Duration::from_std(d)
                        .map_err(|e| QueueError::Validation(e.to_string()))?;
                (JobStatus::Delayed, Some(until))
            }
            _ => (JobStatus::Waiting, None),
        };

        let job = Job {
            id: Uuid::new_v4(),
            queue: self.inner.name.clone(),
            kind: kind.to_string(),
            payload,
            status,
            attempts: 0,
            max_attempts: opts
                .max_attempts
                .unwrap_or(self.inner.config.retry.max_attempts)
                .max(1),
            priority: opts.priority,
            progress: None,
            result: None,
            error: None,
            created_at: now,
            delay_until,
            processed_at: None,
            finished_at: None,
            lease_token: None,
            lease_expires_at: None,
        };

        self.inner.store.enqueue(job.clone()).await?;
        tracing::debug!(job_id = %job.id, kind = %job.kind, queue = %job.queue, "enqueued");
        self.inner.events.emit(&JobEvent::Enqueued {
            job_id: job.id,
            kind: job.kind.clone(),
        });
        Ok(job)
    }

    /// Register `handler` for its kind with `concurrency` worker slots and
    /// start leasing immediately.
    ///
    /// Calling again for the same kind replaces the registration: the old
    /// pool stops leasing and its in-flight claims complete under the old
    /// handler.
    pub fn process<H: JobHandler>(&self, handler: H, concurrency: usize) -> Result<()> {
        let mut pools = self
            .inner
            .pools
            .lock()
            .map_err(|_| QueueError::Store("lock poisoned".to_string()))?;
        // Checked under the registry lock so a racing close() cannot miss
        // this pool.
        self.ensure_open()?;
        let pool = WorkerPool::start(
            self.inner.name.clone(),
            H::KIND.to_string(),
            Arc::new(handler),
            concurrency,
            Arc::clone(&self.inner.store),
            self.inner.config.clone(),
            Arc::clone(&self.inner.events),
        );
        if let Some(old) = pools.active.insert(H::KIND.to_string(), pool) {
            tracing::debug!(kind = H::KIND, "handler replaced, draining old pool");
            old.signal_shutdown();
            pools.retired.push(old);
        }
        Ok(())
    }

    /// Publish progress for a job from the handler currently holding its
    /// lease. Advisory: silently ignored when the lease has lapsed.
    ///
    /// Handlers normally use [`JobContext::report_progress`] instead; this
    /// form exists for code that carries the claimed [`Job`] around.
    pub async fn update_progress(
        &self,
        job: &Job,
        percentage: u8,
        message: impl Into<String>,
    ) -> Result<()> {
        let Some(lease) = job.lease_token else {
            return Ok(());
        };
        self.inner
            .store
            .write_progress(job.id, lease, Progress::new(percentage, message))
            .await?;
        Ok(())
    }

    /// Point-in-time counts per status. Best effort: not transactionally
    /// consistent with concurrent settles.
    pub async fn get_stats(&self) -> Result<QueueStats> {
        let counts = self.inner.store.count_by_status(&self.inner.name).await?;
        let stalled = self.inner.store.stalled_total(&self.inner.name).await?;
        Ok(QueueStats::from_counts(counts, stalled))
    }

    /// Look up one job record, e.g. to inspect a terminal `error`.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.store.get(id).await
    }

    /// Register a callback invoked after every job state transition.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.inner.events.register(Box::new(callback));
    }

    /// Cooperative shutdown with the configured grace period.
    pub async fn close(&self) -> Result<()> {
        self.close_with_grace(self.inner.config.shutdown_grace).await
    }

    /// Stop all pools from taking new leases, wait up to `grace` for
    /// in-flight handlers, then abandon the rest. Abandoned leases lapse
    /// and their jobs are reclaimed by whoever sweeps next.
    ///
    /// After this returns, `add` and `process` fail with
    /// [`QueueError::Closed`].
    pub async fn close_with_grace(&self, grace: Duration) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);

        let pools: Vec<WorkerPool> = {
            let mut guard = self
                .inner
                .pools
                .lock()
                .map_err(|_| QueueError::Store("lock poisoned".to_string()))?;
            let mut drained: Vec<WorkerPool> = guard.active.drain().map(|(_, p)| p).collect();
            drained.append(&mut guard.retired);
            drained
        };

        for pool in &pools {
            pool.signal_shutdown();
        }
        let abort_handles: Vec<_> = pools.iter().flat_map(|p| p.abort_handles()).collect();
        let handles: Vec<_> = pools.into_iter().flat_map(|p| p.into_handles()).collect();

        let drained = tokio::time::timeout(grace, futures_util::future::join_all(handles)).await;
        if drained.is_err() {
            tracing::warn!(
                queue = %self.inner.name,
                "grace period elapsed, abandoning in-flight leases"
            );
            for handle in abort_handles {
                handle.abort();
            }
        }
        tracing::debug!(queue = %self.inner.name, "queue closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

//! # WorkQ
//!
//! Durable background job queue: typed units of asynchronous work,
//! distributed across bounded pools of concurrent workers, with leases,
//! progress tracking, retries with exponential backoff, and per-status
//! statistics.
//!
//! Jobs are consumed exactly once per attempt by the handler registered
//! for their kind — this is a work queue, not pub/sub. Durability and
//! cross-process claim atomicity come from the [`JobStore`]; the bundled
//! [`MemoryStore`] is for tests and development, the Redis store (feature
//! `redis`) for production.

pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod store;
mod worker;

pub use config::{QueueConfig, RetryPolicy};
pub use error::{QueueError, Result};
pub use handler::{JobContext, JobHandler};
pub use job::{Job, JobId, JobStatus, Progress};
pub use queue::{AddOptions, JobEvent, Queue};
pub use retry::RetryDecision;
pub use stats::QueueStats;
pub use store::memory::MemoryStore;
pub use store::{JobStore, StatusUpdate, TransitionOutcome};

#[cfg(feature = "redis")]
pub use store::redis::RedisStore;

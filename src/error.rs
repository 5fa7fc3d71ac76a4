use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed `add` input, rejected before anything is persisted.
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store is unreachable or misbehaving. Surfaced to the
    /// caller of `add`/`process`/`get_stats`; never retried internally.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    /// Raised by handler logic. Contained within the worker pool and
    /// resolved via retry or terminal failure on the job record.
    ///
    /// A lapsed lease is not an error: conditional writes report it as
    /// [`TransitionOutcome::Conflict`](crate::TransitionOutcome), which
    /// workers record as a stall.
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Queue is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

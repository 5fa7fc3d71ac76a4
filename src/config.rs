use std::time::Duration;

/// Retry behavior for failed attempts.
///
/// On a retryable failure the next delay is
/// `initial_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt ceiling before a job is terminally failed.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn initial_delay(mut self, d: Duration) -> Self {
        self.initial_delay = d;
        self
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn multiplier(mut self, m: f64) -> Self {
        self.multiplier = if m < 1.0 { 1.0 } else { m };
        self
    }
}

/// Queue-level configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Default retry policy; `max_attempts` is overridable per job.
    pub retry: RetryPolicy,
    /// Visibility timeout for claims. A handler that neither completes
    /// nor fails within this window is considered stalled and its job
    /// becomes claimable by another slot.
    pub lease_ttl: Duration,
    /// Slot sleep when a claim comes back empty.
    pub poll_interval: Duration,
    /// Slot back-off after a store error during leasing.
    pub claim_backoff: Duration,
    /// How long `close()` waits for in-flight handlers before abandoning
    /// their leases.
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            claim_backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn lease_ttl(mut self, d: Duration) -> Self {
        self.lease_ttl = d;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn shutdown_grace(mut self, d: Duration) -> Self {
        self.shutdown_grace = d;
        self
    }
}

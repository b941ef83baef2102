use std::time::Duration;

/// Retry behavior applied to every webhook that enters retrying.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Capacity of each per-webhook retry queue and backoff-reset channel.
    pub capacity: usize,

    /// Initial backoff after the first failure.
    pub exponential_base: Duration,

    /// Accepted for forward compatibility; only a factor of 2.0 is
    /// honored. The backoff formula is `base * 2^failure_count`.
    pub exponential_factor: f64,

    /// Ceiling for the computed backoff.
    pub max_backoff: Duration,

    /// Maximum time a webhook may remain retrying before it is marked
    /// unavailable and its pending events failed.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            exponential_base: Duration::from_secs(1),
            exponential_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            timeout: Duration::from_secs(600),
        }
    }
}

impl RetryConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_exponential_base(mut self, base: Duration) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Top-level engine configuration.
///
/// Construction only; file and environment parsing live with the caller.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the sliding error bus.
    pub error_sliding_capacity: usize,

    pub retry: RetryConfig,

    /// When set, new events are grouped per (webhook id, content type)
    /// into bounded queues of this capacity before dispatch. When unset,
    /// every event is delivered individually.
    pub batching_capacity: Option<usize>,

    /// Parallelism bound for non-batched delivery and single-mode retry.
    pub max_single_dispatch_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            error_sliding_capacity: 256,
            retry: RetryConfig::default(),
            batching_capacity: None,
            max_single_dispatch_concurrency: 16,
        }
    }
}

impl ServerConfig {
    pub fn with_error_sliding_capacity(mut self, capacity: usize) -> Self {
        self.error_sliding_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batching_capacity(mut self, capacity: usize) -> Self {
        self.batching_capacity = Some(capacity);
        self
    }

    pub fn with_max_single_dispatch_concurrency(mut self, limit: usize) -> Self {
        self.max_single_dispatch_concurrency = limit;
        self
    }
}

//! The `CounterStore` port.

use std::time::Duration;

/// Trailing-window counting strategy for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    /// Exact sliding window: per-event timestamps, evicted on read.
    Sliding {
        /// Trailing window length.
        window: Duration,
    },
    /// Fixed-bucket approximation: `buckets` rotating sub-windows covering
    /// `window` in total. Bounds memory per key at the cost of up to one
    /// sub-window of imprecision at the trailing edge.
    FixedBuckets {
        /// Trailing window length.
        window: Duration,
        /// Number of rotating sub-windows.
        buckets: u32,
    },
}

impl WindowSpec {
    /// The trailing window length of this spec.
    pub fn window(&self) -> Duration {
        match self {
            Self::Sliding { window } => *window,
            Self::FixedBuckets { window, .. } => *window,
        }
    }
}

/// Errors surfaced by a counter store.
#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    /// The backing store could not be reached. The caller decides whether
    /// to fail open (see `FailoverCounterStore`).
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Atomic key-scoped counter operations shared by the rate limiter and the
/// abuse detection engine.
///
/// Implementations must make each method atomic per key: two concurrent
/// `admit_token` calls against a bucket holding one token must never both
/// succeed, and concurrent `incr_and_get` calls must each observe a
/// distinct count. Keys are opaque namespaced strings (`rl:`, `ab:`,
/// `dd:` prefixes by convention).
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Token-bucket admission check.
    ///
    /// Refills the bucket by elapsed time (`tokens = min(capacity, tokens +
    /// elapsed * refill_per_sec)`), then consumes one token if at least one
    /// is available. Returns `true` if the request is admitted.
    async fn admit_token(
        &self,
        key: &str,
        capacity: u32,
        refill_per_sec: f64,
    ) -> Result<bool, CounterError>;

    /// Records one qualifying event and returns the trailing-window count,
    /// including the event just recorded.
    async fn incr_and_get(&self, key: &str, window: WindowSpec) -> Result<u64, CounterError>;

    /// Reads the trailing-window count without recording an event.
    async fn probe(&self, key: &str, window: WindowSpec) -> Result<u64, CounterError>;

    /// Sets a flag key with a TTL. Returns `true` if the flag was newly
    /// set, `false` if it already existed and has not expired. Used for
    /// duplicate-delivery suppression.
    async fn set_once(&self, key: &str, ttl: Duration) -> Result<bool, CounterError>;

    /// Discards all state held for a key.
    async fn forget(&self, key: &str) -> Result<(), CounterError>;

    /// Evicts entries idle for at least `idle_for`. Returns the number of
    /// evicted entries. Called periodically by the maintenance task.
    async fn evict_idle(&self, idle_for: Duration) -> Result<usize, CounterError>;
}

//! Fail-open wrapper around a primary counter store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::memory::MemoryCounterStore;
use crate::store::{CounterError, CounterStore, WindowSpec};

/// Delegates to a primary store and falls back to an in-process
/// [`MemoryCounterStore`] when the primary is unavailable.
///
/// An outage in the counter backend must not silently block all traffic:
/// the gateway keeps admitting and counting against local state and raises
/// an operational alarm. Counts diverge across instances while failed over;
/// that is the accepted cost of staying up.
pub struct FailoverCounterStore {
    primary: Arc<dyn CounterStore>,
    fallback: MemoryCounterStore,
    failovers: AtomicU64,
}

impl FailoverCounterStore {
    pub fn new(primary: Arc<dyn CounterStore>) -> Self {
        Self {
            primary,
            fallback: MemoryCounterStore::new(),
            failovers: AtomicU64::new(0),
        }
    }

    /// Total number of operations served by the fallback store.
    ///
    /// The maintenance task watches this to surface failovers in the audit
    /// log; the counter itself never resets.
    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    fn note_failover(&self, operation: &str, err: &CounterError) {
        let total = self.failovers.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::error!(
            operation,
            total_failovers = total,
            "counter store unavailable, failing open to in-process state: {}",
            err
        );
    }
}

#[async_trait::async_trait]
impl CounterStore for FailoverCounterStore {
    async fn admit_token(
        &self,
        key: &str,
        capacity: u32,
        refill_per_sec: f64,
    ) -> Result<bool, CounterError> {
        match self.primary.admit_token(key, capacity, refill_per_sec).await {
            Ok(admitted) => Ok(admitted),
            Err(err) => {
                self.note_failover("admit_token", &err);
                self.fallback.admit_token(key, capacity, refill_per_sec).await
            }
        }
    }

    async fn incr_and_get(&self, key: &str, window: WindowSpec) -> Result<u64, CounterError> {
        match self.primary.incr_and_get(key, window).await {
            Ok(count) => Ok(count),
            Err(err) => {
                self.note_failover("incr_and_get", &err);
                self.fallback.incr_and_get(key, window).await
            }
        }
    }

    async fn probe(&self, key: &str, window: WindowSpec) -> Result<u64, CounterError> {
        match self.primary.probe(key, window).await {
            Ok(count) => Ok(count),
            Err(err) => {
                self.note_failover("probe", &err);
                self.fallback.probe(key, window).await
            }
        }
    }

    async fn set_once(&self, key: &str, ttl: Duration) -> Result<bool, CounterError> {
        match self.primary.set_once(key, ttl).await {
            Ok(fresh) => Ok(fresh),
            Err(err) => {
                self.note_failover("set_once", &err);
                self.fallback.set_once(key, ttl).await
            }
        }
    }

    async fn forget(&self, key: &str) -> Result<(), CounterError> {
        // Best effort on both sides: the fallback may hold shadow state for
        // the key from an earlier outage.
        let primary = self.primary.forget(key).await;
        let _ = self.fallback.forget(key).await;
        if let Err(err) = primary {
            self.note_failover("forget", &err);
        }
        Ok(())
    }

    async fn evict_idle(&self, idle_for: Duration) -> Result<usize, CounterError> {
        let fallback_evicted = self.fallback.evict_idle(idle_for).await.unwrap_or(0);
        match self.primary.evict_idle(idle_for).await {
            Ok(evicted) => Ok(evicted + fallback_evicted),
            Err(err) => {
                self.note_failover("evict_idle", &err);
                Ok(fallback_evicted)
            }
        }
    }
}

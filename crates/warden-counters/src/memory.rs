//! In-process `CounterStore` implementation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::store::{CounterError, CounterStore, WindowSpec};
use crate::window::{FixedBuckets, SlidingWindow, TokenBucket};

/// Per-key state. A key holds exactly one kind of counter for its lifetime;
/// namespaced key prefixes keep the kinds from colliding.
#[derive(Debug)]
enum Entry {
    Bucket(TokenBucket),
    Sliding(SlidingWindow),
    Fixed(FixedBuckets),
    Flag { set_at: Instant, ttl: Duration },
}

impl Entry {
    /// Last time this entry was touched, for idle eviction.
    fn touched_at(&self) -> Option<Instant> {
        match self {
            Entry::Bucket(b) => Some(b.touched_at()),
            Entry::Sliding(s) => s.touched_at(),
            Entry::Fixed(f) => Some(f.touched_at()),
            Entry::Flag { set_at, .. } => Some(*set_at),
        }
    }
}

/// In-memory counter store.
///
/// Every operation takes the map lock once, mutates one key's entry, and
/// releases — the per-key read-modify-write is atomic and no lock is held
/// across an await point. Suitable as the single-instance production store
/// and as the fail-open fallback behind a distributed one.
pub struct MemoryCounterStore {
    state: Mutex<HashMap<String, Entry>>,
}

/// Entry count beyond which a safety eviction sweep runs inline.
///
/// The periodic maintenance task normally keeps the map small; this bound
/// only matters if that task is misconfigured or wedged.
const INLINE_EVICTION_THRESHOLD: usize = 100_000;

/// Idle horizon used by the inline safety sweep.
const INLINE_EVICTION_IDLE: Duration = Duration::from_secs(600);

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the map, recovering from poisoning.
    ///
    /// A poisoned lock means a panic elsewhere; refusing all admission
    /// checks over a stale counter would turn that into a full outage.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("counter store lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }

    fn evict_locked(
        state: &mut HashMap<String, Entry>,
        idle_for: Duration,
        now: Instant,
    ) -> usize {
        let before = state.len();
        state.retain(|_, entry| match entry.touched_at() {
            Some(touched) => now.saturating_duration_since(touched) < idle_for,
            None => false,
        });
        before - state.len()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    async fn admit_token(
        &self,
        key: &str,
        capacity: u32,
        refill_per_sec: f64,
    ) -> Result<bool, CounterError> {
        let now = Instant::now();
        let mut state = self.lock();

        if state.len() > INLINE_EVICTION_THRESHOLD {
            Self::evict_locked(&mut state, INLINE_EVICTION_IDLE, now);
        }

        let entry = state
            .entry(key.to_string())
            .or_insert_with(|| Entry::Bucket(TokenBucket::new(capacity, now)));

        match entry {
            Entry::Bucket(bucket) => Ok(bucket.admit(capacity, refill_per_sec, now)),
            // Key collided with another counter kind; start a fresh bucket
            // rather than corrupt the other state.
            other => {
                let mut bucket = TokenBucket::new(capacity, now);
                let admitted = bucket.admit(capacity, refill_per_sec, now);
                *other = Entry::Bucket(bucket);
                Ok(admitted)
            }
        }
    }

    async fn incr_and_get(&self, key: &str, window: WindowSpec) -> Result<u64, CounterError> {
        let now = Instant::now();
        let mut state = self.lock();

        if state.len() > INLINE_EVICTION_THRESHOLD {
            Self::evict_locked(&mut state, INLINE_EVICTION_IDLE, now);
        }

        let entry = state.entry(key.to_string()).or_insert_with(|| match window {
            WindowSpec::Sliding { .. } => Entry::Sliding(SlidingWindow::new()),
            WindowSpec::FixedBuckets { window, buckets } => {
                Entry::Fixed(FixedBuckets::new(window, buckets, now))
            }
        });

        match (entry, window) {
            (Entry::Sliding(sw), WindowSpec::Sliding { window }) => Ok(sw.record(window, now)),
            (Entry::Fixed(fb), WindowSpec::FixedBuckets { .. }) => Ok(fb.record(now)),
            (entry, spec) => {
                // Strategy changed for this key (config edit); restart.
                let count = match spec {
                    WindowSpec::Sliding { window } => {
                        let mut sw = SlidingWindow::new();
                        let count = sw.record(window, now);
                        *entry = Entry::Sliding(sw);
                        count
                    }
                    WindowSpec::FixedBuckets { window, buckets } => {
                        let mut fb = FixedBuckets::new(window, buckets, now);
                        let count = fb.record(now);
                        *entry = Entry::Fixed(fb);
                        count
                    }
                };
                Ok(count)
            }
        }
    }

    async fn probe(&self, key: &str, window: WindowSpec) -> Result<u64, CounterError> {
        let now = Instant::now();
        let mut state = self.lock();

        match state.get_mut(key) {
            Some(Entry::Sliding(sw)) => match window {
                WindowSpec::Sliding { window } => Ok(sw.count(window, now)),
                _ => Ok(0),
            },
            Some(Entry::Fixed(fb)) => Ok(fb.count(now)),
            _ => Ok(0),
        }
    }

    async fn set_once(&self, key: &str, ttl: Duration) -> Result<bool, CounterError> {
        let now = Instant::now();
        let mut state = self.lock();

        if state.len() > INLINE_EVICTION_THRESHOLD {
            Self::evict_locked(&mut state, INLINE_EVICTION_IDLE, now);
        }

        let already_set = matches!(
            state.get(key),
            Some(Entry::Flag { set_at, ttl: set_ttl })
                if now.saturating_duration_since(*set_at) < *set_ttl
        );
        if already_set {
            return Ok(false);
        }

        state.insert(key.to_string(), Entry::Flag { set_at: now, ttl });
        Ok(true)
    }

    async fn forget(&self, key: &str) -> Result<(), CounterError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn evict_idle(&self, idle_for: Duration) -> Result<usize, CounterError> {
        let now = Instant::now();
        let mut state = self.lock();
        Ok(Self::evict_locked(&mut state, idle_for, now))
    }
}

//! Counting primitives: token bucket, sliding window, fixed buckets.
//!
//! These are plain data structures; atomicity is the store's concern. Time
//! is taken from `tokio::time::Instant` so tests can drive them with a
//! paused clock.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Admission-control bucket that accumulates capacity at a fixed refill
/// rate and spends one token per admitted request.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    /// Refills by elapsed time, then consumes one token if available.
    ///
    /// Capacity and refill rate are passed per call: they come from
    /// per-tenant configuration and may change between calls, in which case
    /// the token count is clamped to the new capacity.
    pub fn admit(&mut self, capacity: u32, refill_per_sec: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(f64::from(capacity));

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Last time this bucket was touched.
    pub fn touched_at(&self) -> Instant {
        self.last_refill
    }
}

/// Exact trailing-window counter: stores one timestamp per qualifying
/// event and evicts expired ones on every access.
///
/// Memory grows with event volume inside the window, so this strategy is
/// reserved for low-volume categories (raid joins).
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one event and returns the count inside the trailing window,
    /// including the event just recorded.
    pub fn record(&mut self, window: Duration, now: Instant) -> u64 {
        self.evict(window, now);
        self.stamps.push_back(now);
        self.stamps.len() as u64
    }

    /// Returns the count inside the trailing window without recording.
    pub fn count(&mut self, window: Duration, now: Instant) -> u64 {
        self.evict(window, now);
        self.stamps.len() as u64
    }

    /// Last time an event was recorded, if any survive eviction.
    pub fn touched_at(&self) -> Option<Instant> {
        self.stamps.back().copied()
    }

    fn evict(&mut self, window: Duration, now: Instant) {
        let cutoff = now.checked_sub(window);
        if let Some(cutoff) = cutoff {
            while matches!(self.stamps.front(), Some(&front) if front <= cutoff) {
                self.stamps.pop_front();
            }
        }
    }
}

/// Fixed-bucket approximation of a trailing window: `slots.len()` rotating
/// sub-windows, each covering `window / slots.len()`.
///
/// The count is exact to within one sub-window at the trailing edge, and
/// memory per key is constant regardless of event volume.
#[derive(Debug, Clone)]
pub struct FixedBuckets {
    slots: Vec<u64>,
    slot_len: Duration,
    cursor: usize,
    cursor_start: Instant,
}

impl FixedBuckets {
    pub fn new(window: Duration, buckets: u32, now: Instant) -> Self {
        let buckets = buckets.max(1) as usize;
        Self {
            slots: vec![0; buckets],
            slot_len: window / buckets as u32,
            cursor: 0,
            cursor_start: now,
        }
    }

    /// Records one event and returns the windowed count, including the
    /// event just recorded.
    pub fn record(&mut self, now: Instant) -> u64 {
        self.rotate(now);
        self.slots[self.cursor] += 1;
        self.total()
    }

    /// Returns the windowed count without recording.
    pub fn count(&mut self, now: Instant) -> u64 {
        self.rotate(now);
        self.total()
    }

    /// Start of the sub-window currently accepting events.
    pub fn touched_at(&self) -> Instant {
        self.cursor_start
    }

    fn total(&self) -> u64 {
        self.slots.iter().sum()
    }

    /// Advances the cursor over every sub-window boundary crossed since the
    /// last access, zeroing the slots it passes.
    fn rotate(&mut self, now: Instant) {
        if self.slot_len.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.cursor_start);
        let steps = (elapsed.as_nanos() / self.slot_len.as_nanos()) as u64;

        if steps as usize >= self.slots.len() {
            // The whole window has passed; everything expires.
            self.slots.fill(0);
            self.cursor = 0;
            self.cursor_start = now;
            return;
        }

        for _ in 0..steps {
            self.cursor = (self.cursor + 1) % self.slots.len();
            self.slots[self.cursor] = 0;
            self.cursor_start += self.slot_len;
        }
    }
}

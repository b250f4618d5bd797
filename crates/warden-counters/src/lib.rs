//! Shared counter state for the Warden gateway: token-bucket admission,
//! trailing-window event counts, and duplicate-delivery flags.
//!
//! The rate limiter and the abuse detection engine keep all their mutable
//! state behind the [`CounterStore`] port. Every operation is an atomic
//! key-scoped read-modify-write — no caller holds a lock spanning more than
//! one operation — so the same contract can be served by the in-process
//! [`MemoryCounterStore`] on a single instance or by a shared atomic store
//! (Redis-style INCR/expire) when the gateway is scaled horizontally.
//!
//! Two window strategies are supported:
//!
//! - **Exact sliding window** (timestamps, evicted on read) for low-volume
//!   categories such as raid joins.
//! - **Fixed-bucket approximation** (N rotating sub-windows) for high-volume
//!   categories such as message floods, bounding memory per key.
//!
//! [`FailoverCounterStore`] wraps a primary store with an in-process
//! fallback: if the primary becomes unavailable the gateway fails open and
//! raises an operational alarm instead of silently blocking all traffic.

mod failover;
mod memory;
mod store;
mod window;

pub use failover::FailoverCounterStore;
pub use memory::MemoryCounterStore;
pub use store::{CounterError, CounterStore, WindowSpec};
pub use window::{FixedBuckets, SlidingWindow, TokenBucket};

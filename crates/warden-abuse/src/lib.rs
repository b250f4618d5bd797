//! Abuse detection engine for the Warden gateway.
//!
//! Maintains trailing-window counts of qualifying events per
//! `(tenant, subject, category)` — per actor for the flood categories —
//! and drives the mitigation state machine:
//!
//! ```text
//! Normal ──count crosses limit──▶ Triggered ──action applied──▶ Cooldown
//!    ▲                                                             │
//!    └──────────── expiry timer fires / manual reversal ───────────┘
//! ```
//!
//! The transition into Triggered is edge-triggered: while a mitigation for
//! the same action and target is active, further threshold crossings are
//! counted but apply nothing. That idempotence is enforced by the
//! mitigation store (a partial unique index over active records), so it
//! holds across horizontally scaled gateway instances, with a small
//! in-process suppression cache in front to keep sustained floods from
//! hammering the store.
//!
//! Expiry is a cancellable timer per mitigation record; manual reversal
//! cancels the timer instead of letting it fire redundantly. Action
//! execution retries with bounded exponential backoff and escalates to an
//! operator-visible alarm when the budget is exhausted.

mod engine;
mod error;
mod executor;
mod store;

pub use engine::{qualifying_categories, AbuseEngine, Verdict};
pub use error::AbuseError;
pub use executor::execute_with_retry;
pub use store::{
    insert_active, list_active, lookup_mitigation, resolve_mitigation, MitigationRecord,
    MitigationStatus, MitigationStore, NewMitigation, SqliteMitigationStore,
};

//! Audit layer for the Warden gateway.
//!
//! Implements the append-only audit log behind the gateway's fire-and-forget
//! `AuditSink` hook. Every identity rejection, pipeline short-circuit,
//! abuse trigger, mitigation lifecycle step, module failure, and admin
//! action is recorded here so operators can reconstruct what the gateway
//! did to any event after the fact.
//!
//! # Audit domains
//!
//! | Domain | Example events |
//! |--------|---------------|
//! | `INGRESS` | `TENANT_REJECTED`, `EVENT_MALFORMED`, `EVENT_DEDUPLICATED`, `QUEUE_SATURATED` |
//! | `PIPELINE` | `STAGE_SHORT_CIRCUIT`, `STAGE_INTERNAL_ERROR` |
//! | `ABUSE` | `THRESHOLD_CROSSED` |
//! | `MITIGATION` | `MITIGATION_APPLIED`, `MITIGATION_EXPIRED`, `MITIGATION_REVERSED`, `MITIGATION_ESCALATED` |
//! | `MODULE` | `MODULE_DISPATCH_FAILED` |
//! | `ADMIN` | `BINDING_REGISTERED`, `BINDING_DISABLED` |
//!
//! # Usage
//!
//! ```rust,ignore
//! use warden_audit::{record_event, AuditPayload};
//!
//! record_event(
//!     &conn,
//!     "tenant-1",
//!     &AuditPayload::TenantRejected {
//!         reason: "unknown_tenant".to_string(),
//!     },
//!     None,
//!     None,
//! )?;
//! ```

mod error;
mod event;
mod sink;
mod store;

pub use error::AuditError;
pub use event::{AuditDomain, AuditPayload, AuditRecord, ParseAuditDomainError};
pub use sink::{AuditSink, NullAuditSink, SqliteAuditSink};
pub use store::{next_seq, query_events, record_event, AuditFilter};

//! Collaborator port traits consumed by the pipeline.
//!
//! The gateway never talks to a concrete backend directly: tenant lookup,
//! group configuration, and platform-level effects are injected behind these
//! traits, with SQLite-backed implementations in `warden-server` and
//! in-memory ones in tests.

use crate::policy::GroupConfig;
use crate::{MitigationAction, TenantRegistration};
use std::time::Duration;

/// Errors surfaced by the read-side stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A query failed for a reason other than availability.
    #[error("store query failed: {0}")]
    Query(String),
}

/// Read contract for tenant registrations.
#[async_trait::async_trait]
pub trait TenantStore: Send + Sync {
    /// Resolves an ingress credential to its tenant registration.
    ///
    /// Returns `Ok(None)` for credentials that map to no tenant.
    async fn resolve(&self, credential: &str) -> Result<Option<TenantRegistration>, StoreError>;
}

/// Read contract for per-subject configuration and actor bans.
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    /// Loads the group config for `(tenant_id, subject_id)`, falling back to
    /// the gateway defaults when the subject has none stored.
    async fn group_config(
        &self,
        tenant_id: &str,
        subject_id: &str,
    ) -> Result<GroupConfig, StoreError>;

    /// Returns `true` if the actor is globally banned for this tenant.
    async fn actor_banned(&self, tenant_id: &str, actor_id: &str) -> Result<bool, StoreError>;
}

/// A platform-level effect requested by the gateway or a module handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// The tenant on whose behalf the action is performed.
    pub tenant_id: String,
    /// The subject conversation the action applies to.
    pub subject_id: String,
    /// The targeted actor; absent for subject-wide actions (lock/unlock).
    pub actor_id: Option<String>,
    /// The action to apply.
    pub action: MitigationAction,
    /// How long the action should last; `None` for indefinite or one-shot.
    pub duration: Option<Duration>,
    /// `true` to lift a previously applied action instead of applying it.
    pub reverse: bool,
}

/// Failure classification for action execution.
///
/// `Retryable` failures are retried with bounded backoff; `Fatal` failures
/// are escalated immediately.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The platform rejected the call transiently (timeouts, 5xx, 429).
    #[error("retryable platform failure: {0}")]
    Retryable(String),
    /// The platform rejected the call permanently (4xx, bad target).
    #[error("fatal platform failure: {0}")]
    Fatal(String),
}

/// Write contract for platform-level effects.
///
/// Implementations must be idempotent and retry-safe: the gateway re-calls
/// `execute` freely when retrying or reversing, and a reversal of an action
/// already lifted out-of-band must succeed as a no-op.
#[async_trait::async_trait]
pub trait ActionSink: Send + Sync {
    /// Applies (or, with `reverse`, lifts) the requested action.
    async fn execute(&self, request: &ActionRequest) -> Result<(), ActionError>;
}

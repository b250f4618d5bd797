//! Audit domain, payload, and record types for the audit log.

use serde::{Deserialize, Serialize};
use warden_types::{AbuseCategory, MitigationAction, RejectReason};

/// Audit event domains.
///
/// Each domain groups related event types for filtering and auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditDomain {
    /// Ingress decisions: rejections, malformed drops, dedup, saturation.
    #[serde(rename = "INGRESS")]
    Ingress,
    /// Pipeline execution: short-circuits and internal stage errors.
    #[serde(rename = "PIPELINE")]
    Pipeline,
    /// Abuse detection: threshold crossings.
    #[serde(rename = "ABUSE")]
    Abuse,
    /// Mitigation lifecycle: applied, expired, reversed, escalated.
    #[serde(rename = "MITIGATION")]
    Mitigation,
    /// Module dispatch failures.
    #[serde(rename = "MODULE")]
    Module,
    /// Operator actions through the admin API.
    #[serde(rename = "ADMIN")]
    Admin,
}

impl AuditDomain {
    /// Returns the canonical string label for this domain.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "INGRESS",
            Self::Pipeline => "PIPELINE",
            Self::Abuse => "ABUSE",
            Self::Mitigation => "MITIGATION",
            Self::Module => "MODULE",
            Self::Admin => "ADMIN",
        }
    }
}

impl std::fmt::Display for AuditDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditDomain {
    type Err = ParseAuditDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INGRESS" => Ok(Self::Ingress),
            "PIPELINE" => Ok(Self::Pipeline),
            "ABUSE" => Ok(Self::Abuse),
            "MITIGATION" => Ok(Self::Mitigation),
            "MODULE" => Ok(Self::Module),
            "ADMIN" => Ok(Self::Admin),
            _ => Err(ParseAuditDomainError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown audit domain string.
#[derive(Debug, Clone)]
pub struct ParseAuditDomainError(pub String);

impl std::fmt::Display for ParseAuditDomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown audit domain: {}", self.0)
    }
}

impl std::error::Error for ParseAuditDomainError {}

/// Structured audit payloads for each event type.
///
/// Payloads are serialised to JSON and stored in the `payload_json` column
/// of the `audit_log` table. Each variant corresponds to an `event_type`
/// string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditPayload {
    // ── Ingress domain ───────────────────────────────────────────────
    /// The identity router rejected an inbound credential.
    TenantRejected {
        /// Why the credential was rejected.
        reason: RejectReason,
    },

    /// An inbound envelope could not be parsed.
    EventMalformed {
        /// Parser error detail.
        detail: String,
    },

    /// A duplicate platform delivery was suppressed.
    EventDeduplicated {
        /// The platform-assigned delivery id.
        dedup_key: String,
    },

    /// The ack-then-process queue refused new work.
    QueueSaturated {
        /// Queue capacity at the time of refusal.
        capacity: usize,
    },

    // ── Pipeline domain ──────────────────────────────────────────────
    /// A stage ended the pipeline run early.
    StageShortCircuit {
        /// The stage that short-circuited.
        stage: String,
        /// The recorded outcome.
        outcome: String,
    },

    /// A stage raised an unexpected error.
    StageInternalError {
        /// The stage that failed.
        stage: String,
        /// Error detail.
        detail: String,
    },

    // ── Abuse domain ─────────────────────────────────────────────────
    /// A trailing-window count crossed its configured limit.
    ThresholdCrossed {
        /// The abuse category that triggered.
        category: AbuseCategory,
        /// The observed count.
        count: u64,
        /// The configured limit.
        limit: u32,
    },

    // ── Mitigation domain ────────────────────────────────────────────
    /// A mitigation was applied.
    MitigationApplied {
        /// The applied action.
        action: MitigationAction,
        /// The category that caused it.
        cause: AbuseCategory,
        /// Seconds until automatic reversal, if time-bounded.
        duration_secs: Option<u64>,
    },

    /// A time-bounded mitigation expired and was reversed.
    MitigationExpired {
        /// The reversed action.
        action: MitigationAction,
    },

    /// An operator manually reversed a mitigation.
    MitigationReversed {
        /// The reversed action.
        action: MitigationAction,
        /// The operator who reversed it.
        operator: String,
    },

    /// Mitigation execution exhausted its retry budget.
    MitigationEscalated {
        /// The action that could not be executed.
        action: MitigationAction,
        /// Number of attempts made.
        attempts: u32,
        /// The final error.
        detail: String,
    },

    /// The counter store failed and the gateway failed open.
    CounterStoreFailedOpen {
        /// The store operation that failed.
        operation: String,
        /// Error detail.
        detail: String,
    },

    // ── Module domain ────────────────────────────────────────────────
    /// A module handler failed, timed out, or panicked.
    ModuleDispatchFailed {
        /// The module that failed.
        module_id: String,
        /// Failure detail.
        detail: String,
    },

    // ── Admin domain ─────────────────────────────────────────────────
    /// A module binding was registered.
    BindingRegistered {
        /// The binding's match key.
        match_key: String,
        /// The bound module.
        module_id: String,
    },

    /// A module binding was disabled.
    BindingDisabled {
        /// The binding's match key.
        match_key: String,
    },
}

impl AuditPayload {
    /// Returns the canonical event type string for this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TenantRejected { .. } => "TENANT_REJECTED",
            Self::EventMalformed { .. } => "EVENT_MALFORMED",
            Self::EventDeduplicated { .. } => "EVENT_DEDUPLICATED",
            Self::QueueSaturated { .. } => "QUEUE_SATURATED",
            Self::StageShortCircuit { .. } => "STAGE_SHORT_CIRCUIT",
            Self::StageInternalError { .. } => "STAGE_INTERNAL_ERROR",
            Self::ThresholdCrossed { .. } => "THRESHOLD_CROSSED",
            Self::MitigationApplied { .. } => "MITIGATION_APPLIED",
            Self::MitigationExpired { .. } => "MITIGATION_EXPIRED",
            Self::MitigationReversed { .. } => "MITIGATION_REVERSED",
            Self::MitigationEscalated { .. } => "MITIGATION_ESCALATED",
            Self::CounterStoreFailedOpen { .. } => "COUNTER_STORE_FAILED_OPEN",
            Self::ModuleDispatchFailed { .. } => "MODULE_DISPATCH_FAILED",
            Self::BindingRegistered { .. } => "BINDING_REGISTERED",
            Self::BindingDisabled { .. } => "BINDING_DISABLED",
        }
    }

    /// Returns the domain for this payload.
    pub fn domain(&self) -> AuditDomain {
        match self {
            Self::TenantRejected { .. }
            | Self::EventMalformed { .. }
            | Self::EventDeduplicated { .. }
            | Self::QueueSaturated { .. } => AuditDomain::Ingress,
            Self::StageShortCircuit { .. } | Self::StageInternalError { .. } => {
                AuditDomain::Pipeline
            }
            Self::ThresholdCrossed { .. } => AuditDomain::Abuse,
            Self::MitigationApplied { .. }
            | Self::MitigationExpired { .. }
            | Self::MitigationReversed { .. }
            | Self::MitigationEscalated { .. }
            | Self::CounterStoreFailedOpen { .. } => AuditDomain::Mitigation,
            Self::ModuleDispatchFailed { .. } => AuditDomain::Module,
            Self::BindingRegistered { .. } | Self::BindingDisabled { .. } => AuditDomain::Admin,
        }
    }
}

/// A single row from the `audit_log` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Auto-incremented row ID.
    pub id: i64,
    /// The tenant the event belongs to.
    pub tenant_id: String,
    /// The audit domain (e.g., `INGRESS`, `ABUSE`).
    pub domain: String,
    /// The specific event type (e.g., `MITIGATION_APPLIED`).
    pub event_type: String,
    /// The subject involved, if any.
    pub subject_id: Option<String>,
    /// The actor involved, if any.
    pub actor_id: Option<String>,
    /// Monotonically increasing sequence number within the tenant.
    pub seq: i64,
    /// The structured event payload as a JSON string.
    pub payload_json: String,
    /// ISO 8601 timestamp of when the event occurred.
    pub occurred_at: String,
}

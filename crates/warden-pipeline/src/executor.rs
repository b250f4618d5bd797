//! Pipeline context, stage contract, and the ordered executor.

use std::sync::Arc;

use warden_audit::{AuditPayload, AuditSink};
use warden_types::{AbuseCategory, GroupConfig, InboundEvent, MitigationAction, TenantRegistration};

/// Mutable state threaded through the stages for one event.
pub struct PipelineContext {
    /// The event being processed.
    pub event: InboundEvent,
    /// The resolved tenant (identity routing happened before the pipeline).
    pub tenant: TenantRegistration,
    /// Group configuration, set by the GroupConfig stage.
    pub config: Option<Arc<GroupConfig>>,
    /// Trust exemption flag, set by the TrustEnrichment stage. Exempt
    /// actors bypass rate limiting and abuse checks.
    pub trust_exempt: bool,
    /// Dispatch result, set by the ModuleDispatch stage.
    pub dispatch: Option<DispatchSummary>,
}

impl PipelineContext {
    pub fn new(event: InboundEvent, tenant: TenantRegistration) -> Self {
        Self {
            event,
            tenant,
            config: None,
            trust_exempt: false,
            dispatch: None,
        }
    }

    /// The group config, which stages after GroupConfig may rely on.
    ///
    /// Erroring instead of panicking keeps a mis-ordered pipeline a
    /// contained `InternalError` rather than a crashed worker.
    pub fn config(&self) -> Result<&Arc<GroupConfig>, StageError> {
        self.config
            .as_ref()
            .ok_or_else(|| StageError::new("group config not loaded before dependent stage"))
    }
}

/// Terminal outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// The actor is globally banned for this tenant; nothing ran.
    ActorBanned,
    /// The actor is out of tokens. Silent: "not yet", not "abuse".
    RateLimited,
    /// The abuse engine applied a mitigation for this event.
    Mitigated {
        category: AbuseCategory,
        action: MitigationAction,
    },
    /// The event crossed a threshold already under active mitigation; it
    /// was counted but nothing new was applied.
    Suppressed { category: AbuseCategory },
    /// All stages ran; dispatch ended as summarised.
    Completed(DispatchSummary),
    /// A stage raised an unexpected error; downstream stages did not run.
    InternalError { stage: String },
}

/// How module dispatch ended for a completed run.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchSummary {
    /// No enabled binding matched; pass-through.
    NoBinding,
    /// The bound module handled the event.
    Handled,
    /// The bound module chose to ignore the event.
    Ignored,
    /// The bound module failed; the failure was isolated and audited.
    ModuleFailed { module_id: String },
}

/// Unexpected stage failure. Converted by the executor into
/// [`PipelineOutcome::InternalError`].
#[derive(Debug, thiserror::Error)]
#[error("{detail}")]
pub struct StageError {
    detail: String,
}

impl StageError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl From<warden_types::StoreError> for StageError {
    fn from(err: warden_types::StoreError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<warden_counters::CounterError> for StageError {
    fn from(err: warden_counters::CounterError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<warden_abuse::AbuseError> for StageError {
    fn from(err: warden_abuse::AbuseError) -> Self {
        Self::new(err.to_string())
    }
}

/// What a stage tells the executor to do next.
pub enum StageFlow {
    /// Proceed to the next stage.
    Continue,
    /// Stop here with a terminal outcome.
    ShortCircuit(PipelineOutcome),
}

/// One pipeline stage.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    /// Stable stage name, used in logs and audit records.
    fn name(&self) -> &'static str;

    /// Processes the context, continuing or short-circuiting the chain.
    async fn handle(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError>;
}

/// The ordered stage chain.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    audit: Arc<dyn AuditSink>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>, audit: Arc<dyn AuditSink>) -> Self {
        Self { stages, audit }
    }

    /// Runs one event through the chain.
    ///
    /// Never panics and never returns an error: every failure mode is a
    /// [`PipelineOutcome`] the caller can log and drop.
    pub async fn run(&self, event: InboundEvent, tenant: TenantRegistration) -> PipelineOutcome {
        let mut ctx = PipelineContext::new(event, tenant);

        for stage in &self.stages {
            match stage.handle(&mut ctx).await {
                Ok(StageFlow::Continue) => {}
                Ok(StageFlow::ShortCircuit(outcome)) => {
                    tracing::debug!(
                        stage = stage.name(),
                        tenant_id = %ctx.event.tenant_id,
                        subject_id = %ctx.event.subject_id,
                        outcome = ?outcome,
                        "pipeline short-circuit"
                    );
                    // Bans are a moderation signal worth a trail. Rate-limit
                    // rejections stay silent, and the abuse engine audits
                    // its own outcomes.
                    if outcome == PipelineOutcome::ActorBanned {
                        self.audit.record(
                            &ctx.event.tenant_id,
                            AuditPayload::StageShortCircuit {
                                stage: stage.name().to_string(),
                                outcome: "actor_banned".to_string(),
                            },
                            Some(&ctx.event.subject_id),
                            Some(&ctx.event.actor_id),
                        );
                    }
                    return outcome;
                }
                Err(err) => {
                    tracing::error!(
                        stage = stage.name(),
                        tenant_id = %ctx.event.tenant_id,
                        "pipeline stage failed: {}",
                        err
                    );
                    self.audit.record(
                        &ctx.event.tenant_id,
                        AuditPayload::StageInternalError {
                            stage: stage.name().to_string(),
                            detail: err.to_string(),
                        },
                        Some(&ctx.event.subject_id),
                        Some(&ctx.event.actor_id),
                    );
                    return PipelineOutcome::InternalError {
                        stage: stage.name().to_string(),
                    };
                }
            }
        }

        PipelineOutcome::Completed(ctx.dispatch.unwrap_or(DispatchSummary::NoBinding))
    }
}

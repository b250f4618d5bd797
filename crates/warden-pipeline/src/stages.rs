//! The six built-in pipeline stages.

use std::sync::Arc;
use std::time::Duration;

use warden_abuse::{AbuseEngine, Verdict};
use warden_audit::{AuditPayload, AuditSink};
use warden_counters::CounterStore;
use warden_modules::{DispatchOutcome, ModuleContext, ModuleOutcome, ModuleRegistry};
use warden_types::{ActionSink, ConfigStore};

use crate::executor::{
    DispatchSummary, PipelineContext, PipelineOutcome, Stage, StageError, StageFlow,
};

/// Auth: rejects events from globally banned actors.
pub struct AuthStage {
    config_store: Arc<dyn ConfigStore>,
}

impl AuthStage {
    pub fn new(config_store: Arc<dyn ConfigStore>) -> Self {
        Self { config_store }
    }
}

#[async_trait::async_trait]
impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        let banned = self
            .config_store
            .actor_banned(&ctx.event.tenant_id, &ctx.event.actor_id)
            .await?;
        if banned {
            return Ok(StageFlow::ShortCircuit(PipelineOutcome::ActorBanned));
        }
        Ok(StageFlow::Continue)
    }
}

/// GroupConfig: loads the subject's configuration onto the context.
pub struct GroupConfigStage {
    config_store: Arc<dyn ConfigStore>,
}

impl GroupConfigStage {
    pub fn new(config_store: Arc<dyn ConfigStore>) -> Self {
        Self { config_store }
    }
}

#[async_trait::async_trait]
impl Stage for GroupConfigStage {
    fn name(&self) -> &'static str {
        "group_config"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        let config = self
            .config_store
            .group_config(&ctx.event.tenant_id, &ctx.event.subject_id)
            .await?;
        ctx.config = Some(Arc::new(config));
        Ok(StageFlow::Continue)
    }
}

/// TrustEnrichment: marks actors the subject's config exempts from rate
/// limiting and abuse checks. The exemption is a flag on the context;
/// downstream stages check the flag, not the config.
pub struct TrustEnrichmentStage;

#[async_trait::async_trait]
impl Stage for TrustEnrichmentStage {
    fn name(&self) -> &'static str {
        "trust_enrichment"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        let config = ctx.config()?.clone();
        ctx.trust_exempt = config
            .trust_exemptions
            .iter()
            .any(|actor| actor == &ctx.event.actor_id);
        Ok(StageFlow::Continue)
    }
}

/// RateLimit: token-bucket admission per actor, plus per (actor, command)
/// for command events. Rejection is silent — "not yet", not "abuse" — so
/// nothing is audited here.
pub struct RateLimitStage {
    counters: Arc<dyn CounterStore>,
}

impl RateLimitStage {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }
}

#[async_trait::async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        if ctx.trust_exempt {
            return Ok(StageFlow::Continue);
        }
        let limits = ctx.config()?.rate_limit.clone();
        let event = &ctx.event;

        let actor_key = format!("rl:{}:{}", event.tenant_id, event.actor_id);
        let admitted = self
            .counters
            .admit_token(&actor_key, limits.capacity, limits.refill_per_sec)
            .await?;
        if !admitted {
            return Ok(StageFlow::ShortCircuit(PipelineOutcome::RateLimited));
        }

        if let Some(command) = event.command() {
            let command_key = format!("rl:{}:{}:{}", event.tenant_id, event.actor_id, command);
            let admitted = self
                .counters
                .admit_token(
                    &command_key,
                    limits.command_capacity,
                    limits.command_refill_per_sec,
                )
                .await?;
            if !admitted {
                return Ok(StageFlow::ShortCircuit(PipelineOutcome::RateLimited));
            }
        }

        Ok(StageFlow::Continue)
    }
}

/// AbuseCheck: runs the event through the abuse detection engine.
pub struct AbuseCheckStage {
    engine: Arc<AbuseEngine>,
}

impl AbuseCheckStage {
    pub fn new(engine: Arc<AbuseEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl Stage for AbuseCheckStage {
    fn name(&self) -> &'static str {
        "abuse_check"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        if ctx.trust_exempt {
            return Ok(StageFlow::Continue);
        }
        let config = ctx.config()?.clone();

        match self.engine.observe(&ctx.event, &config).await? {
            Verdict::Clean => Ok(StageFlow::Continue),
            Verdict::Mitigated {
                category, action, ..
            } => Ok(StageFlow::ShortCircuit(PipelineOutcome::Mitigated {
                category,
                action,
            })),
            Verdict::Suppressed { category } => Ok(StageFlow::ShortCircuit(
                PipelineOutcome::Suppressed { category },
            )),
        }
    }
}

/// ModuleDispatch: hands the event to its bound module, if any.
///
/// Module failures are audited and summarised on the context; they end the
/// run as `Completed(ModuleFailed)` rather than an internal error, because
/// the pipeline itself did its job.
pub struct ModuleDispatchStage {
    registry: Arc<ModuleRegistry>,
    actions: Arc<dyn ActionSink>,
    audit: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl ModuleDispatchStage {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        actions: Arc<dyn ActionSink>,
        audit: Arc<dyn AuditSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            actions,
            audit,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Stage for ModuleDispatchStage {
    fn name(&self) -> &'static str {
        "module_dispatch"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        let module_ctx = ModuleContext {
            config: ctx.config()?.clone(),
            actions: self.actions.clone(),
        };

        let summary = match self
            .registry
            .dispatch(&ctx.event, module_ctx, self.timeout)
            .await
        {
            DispatchOutcome::NoBinding => DispatchSummary::NoBinding,
            DispatchOutcome::Completed(ModuleOutcome::Handled) => DispatchSummary::Handled,
            DispatchOutcome::Completed(ModuleOutcome::Ignored) => DispatchSummary::Ignored,
            DispatchOutcome::Failed(err) => {
                tracing::warn!(
                    module_id = err.module_id(),
                    tenant_id = %ctx.event.tenant_id,
                    "module dispatch failed: {}",
                    err
                );
                self.audit.record(
                    &ctx.event.tenant_id,
                    AuditPayload::ModuleDispatchFailed {
                        module_id: err.module_id().to_string(),
                        detail: err.to_string(),
                    },
                    Some(&ctx.event.subject_id),
                    Some(&ctx.event.actor_id),
                );
                DispatchSummary::ModuleFailed {
                    module_id: err.module_id().to_string(),
                }
            }
        };

        ctx.dispatch = Some(summary);
        Ok(StageFlow::Continue)
    }
}

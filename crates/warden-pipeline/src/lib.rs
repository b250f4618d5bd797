//! Middleware pipeline executor for the Warden gateway.
//!
//! A chain-of-responsibility over an ordered list of stages:
//!
//! ```text
//! Auth → GroupConfig → TrustEnrichment → RateLimit → AbuseCheck → ModuleDispatch
//! ```
//!
//! Each stage either continues the chain (possibly enriching the shared
//! [`PipelineContext`]) or short-circuits with a terminal
//! [`PipelineOutcome`]. A stage that raises an unexpected error becomes
//! `PipelineOutcome::InternalError` — recorded, logged, and contained; a
//! stage failure can never crash the worker or reach the ingress.
//!
//! Trust exemptions are a boolean on the context, set once by the
//! TrustEnrichment stage and honored by the RateLimit and AbuseCheck
//! stages, instead of branching duplicated inside every stage.

mod executor;
mod stages;

#[cfg(test)]
mod tests;

pub use executor::{
    DispatchSummary, Pipeline, PipelineContext, PipelineOutcome, Stage, StageError, StageFlow,
};
pub use stages::{
    AbuseCheckStage, AuthStage, GroupConfigStage, ModuleDispatchStage, RateLimitStage,
    TrustEnrichmentStage,
};

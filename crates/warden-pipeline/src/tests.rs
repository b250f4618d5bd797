//! End-to-end pipeline tests over in-memory collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use warden_abuse::{AbuseEngine, SqliteMitigationStore};
use warden_audit::NullAuditSink;
use warden_counters::MemoryCounterStore;
use warden_db::{create_pool, run_migrations, DbRuntimeSettings};
use warden_modules::{
    BindingKey, Module, ModuleContext, ModuleError, ModuleOutcome, ModuleRegistry,
};
use warden_types::policy::RetryConfig;
use warden_types::{
    AbuseCategory, ActionError, ActionRequest, ActionSink, ConfigStore, EventKind, GroupConfig,
    InboundEvent, MitigationAction, StoreError, TenantRegistration, TenantStatus,
};

use crate::executor::{DispatchSummary, Pipeline, PipelineOutcome};
use crate::stages::{
    AbuseCheckStage, AuthStage, GroupConfigStage, ModuleDispatchStage, RateLimitStage,
    TrustEnrichmentStage,
};

/// In-memory `ConfigStore` double.
#[derive(Default)]
struct MemConfigStore {
    configs: HashMap<(String, String), GroupConfig>,
    bans: HashSet<(String, String)>,
    fail_config_loads: bool,
}

#[async_trait::async_trait]
impl ConfigStore for MemConfigStore {
    async fn group_config(
        &self,
        tenant_id: &str,
        subject_id: &str,
    ) -> Result<GroupConfig, StoreError> {
        if self.fail_config_loads {
            return Err(StoreError::Unavailable("config backend down".into()));
        }
        Ok(self
            .configs
            .get(&(tenant_id.to_string(), subject_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn actor_banned(&self, tenant_id: &str, actor_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .bans
            .contains(&(tenant_id.to_string(), actor_id.to_string())))
    }
}

struct NoopSink;

#[async_trait::async_trait]
impl ActionSink for NoopSink {
    async fn execute(&self, _request: &ActionRequest) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Module double counting invocations.
struct CountingModule {
    id: &'static str,
    invocations: AtomicU32,
    fail: bool,
}

impl CountingModule {
    fn new(id: &'static str, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            invocations: AtomicU32::new(0),
            fail,
        })
    }
}

#[async_trait::async_trait]
impl Module for CountingModule {
    fn id(&self) -> &str {
        self.id
    }

    async fn invoke(
        &self,
        _event: &InboundEvent,
        _ctx: ModuleContext,
    ) -> Result<ModuleOutcome, ModuleError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ModuleError("handler exploded".into()))
        } else {
            Ok(ModuleOutcome::Handled)
        }
    }
}

fn tenant() -> TenantRegistration {
    TenantRegistration {
        tenant_id: "t1".into(),
        secret_hash: "ab".repeat(32),
        status: TenantStatus::Active,
        created_at: "2026-01-01 00:00:00".into(),
    }
}

fn message(actor: &str, text: &str) -> InboundEvent {
    InboundEvent {
        tenant_id: "t1".into(),
        subject_id: "-100".into(),
        actor_id: actor.into(),
        kind: EventKind::Message,
        payload: json!({ "text": text }),
        received_at: 0,
        dedup_key: "d1".into(),
    }
}

/// Builds a full six-stage pipeline over the given collaborators.
fn pipeline(config_store: Arc<MemConfigStore>, registry: Arc<ModuleRegistry>) -> Pipeline {
    let counters = Arc::new(MemoryCounterStore::new());
    let pool = create_pool(
        ":memory:",
        DbRuntimeSettings {
            busy_timeout_ms: 1_000,
            pool_max_size: 1,
        },
    )
    .expect("pool");
    run_migrations(&pool.get().expect("conn")).expect("migrations");

    let actions: Arc<dyn ActionSink> = Arc::new(NoopSink);
    let audit = Arc::new(NullAuditSink);
    let engine = Arc::new(AbuseEngine::new(
        counters.clone(),
        Arc::new(SqliteMitigationStore::new(pool)),
        actions.clone(),
        audit.clone(),
        RetryConfig::default(),
    ));

    Pipeline::new(
        vec![
            Arc::new(AuthStage::new(config_store.clone())),
            Arc::new(GroupConfigStage::new(config_store)),
            Arc::new(TrustEnrichmentStage),
            Arc::new(RateLimitStage::new(counters)),
            Arc::new(AbuseCheckStage::new(engine)),
            Arc::new(ModuleDispatchStage::new(
                registry,
                actions,
                audit.clone(),
                Duration::from_millis(500),
            )),
        ],
        audit,
    )
}

#[tokio::test]
async fn plain_message_passes_through() {
    let pipeline = pipeline(Arc::new(MemConfigStore::default()), Arc::new(ModuleRegistry::new()));

    let outcome = pipeline.run(message("u1", "hello"), tenant()).await;
    assert_eq!(
        outcome,
        PipelineOutcome::Completed(DispatchSummary::NoBinding)
    );
}

#[tokio::test]
async fn banned_actor_stops_before_dispatch() {
    let mut store = MemConfigStore::default();
    store.bans.insert(("t1".into(), "u1".into()));

    let registry = Arc::new(ModuleRegistry::new());
    let module = CountingModule::new("filter", false);
    let mut config = GroupConfig::default();
    config.enabled_modules = vec!["filter".into()];
    store
        .configs
        .insert(("t1".into(), "-100".into()), config);
    registry
        .register("t1", BindingKey::Kind(EventKind::Message), module.clone())
        .expect("register");

    let pipeline = pipeline(Arc::new(store), registry);

    let outcome = pipeline.run(message("u1", "hi"), tenant()).await;
    assert_eq!(outcome, PipelineOutcome::ActorBanned);
    assert_eq!(
        module.invocations.load(Ordering::SeqCst),
        0,
        "no stage after auth may run"
    );

    // Another actor in the same subject is unaffected.
    let outcome = pipeline.run(message("u2", "hi"), tenant()).await;
    assert_eq!(outcome, PipelineOutcome::Completed(DispatchSummary::Handled));
}

#[tokio::test]
async fn rate_limit_rejects_silently_after_capacity() {
    let mut store = MemConfigStore::default();
    let mut config = GroupConfig::default();
    config.rate_limit.capacity = 2;
    config.rate_limit.refill_per_sec = 0.0;
    store.configs.insert(("t1".into(), "-100".into()), config);

    let pipeline = pipeline(Arc::new(store), Arc::new(ModuleRegistry::new()));

    for _ in 0..2 {
        let outcome = pipeline.run(message("u1", "hi"), tenant()).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Completed(DispatchSummary::NoBinding)
        );
    }
    let outcome = pipeline.run(message("u1", "hi"), tenant()).await;
    assert_eq!(outcome, PipelineOutcome::RateLimited);
}

#[tokio::test]
async fn trusted_actor_bypasses_rate_limit_and_abuse() {
    let mut store = MemConfigStore::default();
    let mut config = GroupConfig::default();
    config.rate_limit.capacity = 1;
    config.rate_limit.refill_per_sec = 0.0;
    config.thresholds.message_flood.limit = 2;
    config.trust_exemptions = vec!["u1".into()];
    store.configs.insert(("t1".into(), "-100".into()), config);

    let pipeline = pipeline(Arc::new(store), Arc::new(ModuleRegistry::new()));

    // Far beyond both the bucket and the flood budget, all pass.
    for _ in 0..10 {
        let outcome = pipeline.run(message("u1", "hi"), tenant()).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Completed(DispatchSummary::NoBinding)
        );
    }
}

#[tokio::test]
async fn flood_crossing_surfaces_mitigation() {
    let mut store = MemConfigStore::default();
    let mut config = GroupConfig::default();
    config.rate_limit.capacity = 100;
    config.thresholds.message_flood.limit = 2;
    config.thresholds.message_flood.window_secs = 30;
    config.thresholds.message_flood.mitigation_secs = 300;
    store.configs.insert(("t1".into(), "-100".into()), config);

    let pipeline = pipeline(Arc::new(store), Arc::new(ModuleRegistry::new()));

    for _ in 0..2 {
        let outcome = pipeline.run(message("u1", "spam"), tenant()).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Completed(DispatchSummary::NoBinding)
        );
    }

    let outcome = pipeline.run(message("u1", "spam"), tenant()).await;
    assert_eq!(
        outcome,
        PipelineOutcome::Mitigated {
            category: AbuseCategory::MessageFlood,
            action: MitigationAction::Mute,
        }
    );

    // Sustained flood during Cooldown is suppressed, not re-mitigated.
    let outcome = pipeline.run(message("u1", "spam"), tenant()).await;
    assert_eq!(
        outcome,
        PipelineOutcome::Suppressed {
            category: AbuseCategory::MessageFlood
        }
    );
}

#[tokio::test]
async fn stage_error_is_contained_as_internal_error() {
    let mut store = MemConfigStore::default();
    store.fail_config_loads = true;

    let registry = Arc::new(ModuleRegistry::new());
    let module = CountingModule::new("filter", false);
    registry
        .register("t1", BindingKey::Kind(EventKind::Message), module.clone())
        .expect("register");

    let pipeline = pipeline(Arc::new(store), registry);

    let outcome = pipeline.run(message("u1", "hi"), tenant()).await;
    assert_eq!(
        outcome,
        PipelineOutcome::InternalError {
            stage: "group_config".into()
        }
    );
    assert_eq!(module.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn module_failure_is_isolated_per_event() {
    let mut store = MemConfigStore::default();
    let mut config = GroupConfig::default();
    config.enabled_modules = vec!["broken".into()];
    store.configs.insert(("t1".into(), "-100".into()), config);

    let registry = Arc::new(ModuleRegistry::new());
    let module = CountingModule::new("broken", true);
    registry
        .register("t1", BindingKey::Kind(EventKind::Message), module.clone())
        .expect("register");

    let pipeline = pipeline(Arc::new(store), registry);

    let outcome = pipeline.run(message("u1", "hi"), tenant()).await;
    assert_eq!(
        outcome,
        PipelineOutcome::Completed(DispatchSummary::ModuleFailed {
            module_id: "broken".into()
        })
    );

    // The failure affects neither later events nor the pipeline itself.
    let outcome = pipeline.run(message("u2", "hi"), tenant()).await;
    assert_eq!(
        outcome,
        PipelineOutcome::Completed(DispatchSummary::ModuleFailed {
            module_id: "broken".into()
        })
    );
    assert_eq!(module.invocations.load(Ordering::SeqCst), 2);
}

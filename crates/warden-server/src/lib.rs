//! Warden gateway server library logic.
//!
//! Wires the ingress, identity router, ack-then-process queue, pipeline,
//! abuse engine, and admin API into one axum application. The binary in
//! `main.rs` loads configuration, builds the gateway, and serves it.

pub mod action_http;
pub mod api_admin;
pub mod background;
pub mod bindings;
pub mod config;
pub mod ingress;
pub mod queue;
pub mod router;
pub mod stores;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use warden_abuse::{AbuseEngine, SqliteMitigationStore};
use warden_audit::{AuditSink, SqliteAuditSink};
use warden_counters::{CounterStore, FailoverCounterStore, MemoryCounterStore};
use warden_db::DbPool;
use warden_modules::ModuleRegistry;
use warden_pipeline::{
    AbuseCheckStage, AuthStage, GroupConfigStage, ModuleDispatchStage, Pipeline, RateLimitStage,
    TrustEnrichmentStage,
};
use warden_types::{ActionSink, GatewayPolicy};

use crate::bindings::{load_registry, BindingError, ModuleCatalog};
use crate::config::Config;
use crate::queue::{EventQueue, QueuedEvent};
use crate::router::TenantRouter;
use crate::stores::{SqliteConfigStore, SqliteTenantStore};

/// Application state shared across all request handlers.
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Gateway-wide policy knobs.
    pub policy: GatewayPolicy,
    /// Cache-first tenant resolver.
    pub router: TenantRouter,
    /// Sending half of the ack-then-process queue.
    pub queue: EventQueue,
    /// Counter store (fail-open over the in-process primary).
    pub counters: Arc<FailoverCounterStore>,
    /// Abuse detection engine.
    pub engine: Arc<AbuseEngine>,
    /// Typed module binding table.
    pub registry: Arc<ModuleRegistry>,
    /// Known module implementations available for binding.
    pub catalog: ModuleCatalog,
    /// Fire-and-forget audit hook.
    pub audit: Arc<dyn AuditSink>,
    /// Group config / ban reads, shared with the pipeline stages.
    pub config_store: Arc<SqliteConfigStore>,
    /// Bearer token for the admin API; `None` disables it.
    pub operator_token: Option<String>,
}

/// A fully wired gateway: shared state, the pipeline for the workers, and
/// the receiving half of the event queue.
pub struct Gateway {
    pub state: Arc<AppState>,
    pub pipeline: Arc<Pipeline>,
    pub queue_rx: mpsc::Receiver<QueuedEvent>,
}

/// Errors raised while wiring the gateway at startup.
#[derive(Debug, thiserror::Error)]
pub enum GatewayInitError {
    /// Could not obtain a connection to load bindings.
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Binding rows could not be read.
    #[error(transparent)]
    Bindings(#[from] BindingError),
}

/// Builds the gateway from configuration and a migrated database pool.
///
/// The module catalog carries the handler implementations linked into this
/// binary; the action sink is how mitigations reach the platform.
pub fn build_gateway(
    config: &Config,
    pool: DbPool,
    catalog: ModuleCatalog,
    actions: Arc<dyn ActionSink>,
) -> Result<Gateway, GatewayInitError> {
    let policy = config.policy.clone();

    let audit: Arc<dyn AuditSink> = Arc::new(SqliteAuditSink::new(pool.clone()));
    let counters = Arc::new(FailoverCounterStore::new(Arc::new(
        MemoryCounterStore::new(),
    )));
    let counters_dyn: Arc<dyn CounterStore> = counters.clone();

    let tenant_store = Arc::new(SqliteTenantStore::new(pool.clone()));
    let config_store = Arc::new(SqliteConfigStore::new(
        pool.clone(),
        policy.default_group.clone(),
    ));

    let engine = Arc::new(AbuseEngine::new(
        counters_dyn.clone(),
        Arc::new(SqliteMitigationStore::new(pool.clone())),
        actions.clone(),
        audit.clone(),
        policy.mitigation_retry.clone(),
    ));

    let registry = Arc::new(ModuleRegistry::new());
    {
        let conn = pool.get()?;
        let loaded = load_registry(&conn, &catalog, &registry)?;
        tracing::info!(loaded, "loaded module bindings into registry");
    }

    let pipeline = Arc::new(Pipeline::new(
        vec![
            Arc::new(AuthStage::new(config_store.clone())),
            Arc::new(GroupConfigStage::new(config_store.clone())),
            Arc::new(TrustEnrichmentStage),
            Arc::new(RateLimitStage::new(counters_dyn)),
            Arc::new(AbuseCheckStage::new(engine.clone())),
            Arc::new(ModuleDispatchStage::new(
                registry.clone(),
                actions,
                audit.clone(),
                Duration::from_millis(policy.module_timeout_ms),
            )),
        ],
        audit.clone(),
    ));

    let (queue, queue_rx) = EventQueue::new(policy.queue_capacity);

    let state = Arc::new(AppState {
        pool,
        policy,
        router: TenantRouter::new(tenant_store),
        queue,
        counters,
        engine,
        registry,
        catalog,
        audit,
        config_store,
        operator_token: config.operator_token.clone(),
    });

    Ok(Gateway {
        state,
        pipeline,
        queue_rx,
    })
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route(
            "/api/admin/mitigations",
            get(api_admin::list_mitigations_handler),
        )
        .route(
            "/api/admin/mitigations/{recordId}/reverse",
            post(api_admin::reverse_mitigation_handler),
        )
        .route("/api/admin/audit", get(api_admin::query_audit_handler))
        .route("/api/admin/tenants", get(api_admin::list_tenants_handler))
        .route(
            "/api/admin/bindings",
            get(api_admin::list_bindings_handler)
                .post(api_admin::register_binding_handler)
                .delete(api_admin::disable_binding_handler),
        )
        .route(
            "/api/admin/groups/{tenantId}/{subjectId}",
            get(api_admin::get_group_config_handler).put(api_admin::put_group_config_handler),
        )
        .layer(axum::middleware::from_fn(
            api_admin::operator_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/ingest/{credential}", post(ingress::ingest_handler))
        .merge(admin_routes)
        .fallback(|| async { (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))) })
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(state))
}

//! Shared helpers for warden-server integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

use warden_server::action_http::LogActionSink;
use warden_server::bindings::ModuleCatalog;
use warden_server::config::Config;
use warden_server::queue::QueuedEvent;
use warden_server::stores::insert_tenant;
use warden_server::{build_gateway, AppState, Gateway};
use warden_types::{ActionSink, TenantStatus};

pub struct TestGateway {
    pub state: Arc<AppState>,
    pub pipeline: Arc<warden_pipeline::Pipeline>,
    pub queue_rx: Option<mpsc::Receiver<QueuedEvent>>,
    pub app: Router,
    // Keeps the on-disk database alive for the test's duration.
    _dir: TempDir,
}

/// Builds a gateway over a fresh file-backed database.
///
/// A file (not `:memory:`) because the pool hands out multiple
/// connections and they must all see one database.
pub fn setup_with(mut config: Config, catalog: ModuleCatalog) -> TestGateway {
    let dir = TempDir::new().expect("tempdir");
    config.database.path = dir
        .path()
        .join("warden.db")
        .to_str()
        .expect("utf-8 path")
        .to_string();

    let pool = warden_db::create_pool(
        &config.database.path,
        warden_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("pool");
    warden_db::run_migrations(&pool.get().expect("conn")).expect("migrations");

    let actions: Arc<dyn ActionSink> = Arc::new(LogActionSink);
    let Gateway {
        state,
        pipeline,
        queue_rx,
    } = build_gateway(&config, pool, catalog, actions).expect("gateway");

    let app = warden_server::app(state.clone());

    TestGateway {
        state,
        pipeline,
        queue_rx: Some(queue_rx),
        app,
        _dir: dir,
    }
}

pub fn setup(config: Config) -> TestGateway {
    setup_with(config, ModuleCatalog::new())
}

/// Registers a tenant directly, as the out-of-band collaborator would.
pub fn seed_tenant(state: &AppState, tenant_id: &str, credential: &str) {
    insert_tenant(
        &state.pool.get().expect("conn"),
        tenant_id,
        credential,
        TenantStatus::Active,
    )
    .expect("insert tenant");
}

/// Drives one request through the router and decodes the JSON body.
pub async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should answer");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Posts a raw string body to the ingress.
pub async fn post_raw(app: &Router, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should answer");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// A platform envelope for the ingress.
pub fn envelope(update_id: i64, kind: &str, payload: Value) -> Value {
    serde_json::json!({
        "update_id": update_id,
        "chat_id": -100,
        "user_id": 7,
        "kind": kind,
        "payload": payload,
        "sent_at": 1_754_000_000,
    })
}

/// Polls the audit log until `event_type` appears for the tenant, or
/// panics after ~2 seconds. Lets tests wait on queue workers.
pub async fn wait_for_audit_event(state: &AppState, tenant_id: &str, event_type: &str) {
    for _ in 0..40 {
        let conn = state.pool.get().expect("conn");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM audit_log WHERE tenant_id = ?1 AND event_type = ?2",
                rusqlite::params![tenant_id, event_type],
                |row| row.get(0),
            )
            .expect("query");
        drop(conn);
        if count > 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("audit event {event_type} for {tenant_id} never appeared");
}

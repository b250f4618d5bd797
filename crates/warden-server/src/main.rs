//! Warden gateway binary — the main entry point.
//!
//! Starts the axum ingress with structured logging, database
//! initialization, pipeline workers, mitigation timer recovery, and
//! graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use warden_server::action_http::{HttpActionSink, LogActionSink};
use warden_server::bindings::ModuleCatalog;
use warden_server::{background, config, queue};
use warden_types::ActionSink;

/// Maintenance sweep interval.
const MAINTENANCE_INTERVAL_SECS: u64 = 60;

/// Idle horizon for counter eviction. Must exceed every configured window;
/// ten minutes comfortably covers the defaults.
const COUNTER_IDLE_SECS: u64 = 600;

/// Grace period for workers to drain the queue at shutdown.
const SHUTDOWN_DRAIN_SECS: u64 = 10;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("WARDEN_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("warden.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the gateway cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = warden_db::create_pool(
        &config.database.path,
        warden_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = warden_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    // The action sink: real platform API when configured, log-only otherwise.
    let actions: Arc<dyn ActionSink> = match &config.platform.api_base_url {
        Some(base_url) => {
            tracing::info!(%base_url, "using HTTP action sink");
            Arc::new(
                HttpActionSink::new(
                    base_url.clone(),
                    Duration::from_millis(config.platform.request_timeout_ms),
                )
                .expect("failed to build platform HTTP client"),
            )
        }
        None => {
            tracing::warn!("no platform API configured, actions will only be logged");
            Arc::new(LogActionSink)
        }
    };

    // Handler modules are linked in by downstream builds; the stock binary
    // ships with an empty catalog and bindings are a no-op pass-through.
    let catalog = ModuleCatalog::new();

    // Build the gateway
    let warden_server::Gateway {
        state,
        pipeline,
        queue_rx,
    } = warden_server::build_gateway(&config, pool, catalog, actions)
        .expect("failed to build gateway");

    // Rebuild expiry timers for mitigations left active by the previous run.
    match state.engine.resume_pending().await {
        Ok(resumed) if resumed > 0 => {
            tracing::info!(resumed, "resumed pending mitigation expiries");
        }
        Ok(_) => {}
        Err(e) => tracing::error!("failed to resume pending mitigations: {}", e),
    }

    // Pipeline workers and maintenance
    let workers = queue::spawn_workers(state.policy.workers, queue_rx, pipeline);
    // Never evict faster than the dedup horizon, or retried deliveries
    // would sneak past suppression.
    let counter_idle_secs = COUNTER_IDLE_SECS.max(state.policy.dedup_ttl_secs);
    let maintenance = tokio::spawn(background::start_maintenance_task(
        state.clone(),
        MAINTENANCE_INTERVAL_SECS,
        counter_idle_secs,
    ));

    // Serve
    let app = warden_server::app(state.clone());
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting warden gateway");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Shutdown: stop timers and maintenance, close the queue (workers exit
    // once every sender is gone), and give them a drain window.
    maintenance.abort();
    state.engine.shutdown();
    drop(state);

    for handle in workers {
        if tokio::time::timeout(Duration::from_secs(SHUTDOWN_DRAIN_SECS), handle)
            .await
            .is_err()
        {
            tracing::warn!("worker did not drain within the shutdown window");
        }
    }

    tracing::info!("warden gateway shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}

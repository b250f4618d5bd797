//! Background maintenance for the Warden gateway.
//!
//! Includes:
//! - TTL eviction of idle counter-store keys.
//! - Tenant cache invalidation so out-of-band registration changes land.
//! - Surfacing counter-store failovers into the audit log.

use crate::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use warden_audit::AuditPayload;
use warden_counters::CounterStore;

/// Starts the maintenance sweep.
///
/// Runs forever at `interval_seconds`. Counter entries idle longer than
/// `idle_seconds` are evicted; the idle horizon should comfortably exceed
/// the longest configured window so live counts are never discarded.
pub async fn start_maintenance_task(
    state: Arc<AppState>,
    interval_seconds: u64,
    idle_seconds: u64,
) {
    if interval_seconds == 0 {
        tracing::warn!("maintenance task disabled (interval=0)");
        return;
    }

    let interval = Duration::from_secs(interval_seconds);
    let idle_for = Duration::from_secs(idle_seconds);
    let mut seen_failovers: u64 = 0;

    tracing::info!(
        interval_seconds,
        idle_seconds,
        "starting maintenance task"
    );

    loop {
        sleep(interval).await;

        match state.counters.evict_idle(idle_for).await {
            Ok(evicted) if evicted > 0 => {
                tracing::debug!(evicted, "evicted idle counter entries");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("counter eviction sweep failed: {}", e);
            }
        }

        state.router.invalidate();

        // Failing open is an operational alarm, not just a log line.
        let failovers = state.counters.failovers();
        if failovers > seen_failovers {
            let delta = failovers - seen_failovers;
            seen_failovers = failovers;
            tracing::error!(
                new_failovers = delta,
                total_failovers = failovers,
                "counter store served operations from the in-process fallback"
            );
            state.audit.record(
                "-",
                AuditPayload::CounterStoreFailedOpen {
                    operation: "sweep".to_string(),
                    detail: format!("{delta} operations failed over since last sweep"),
                },
                None,
                None,
            );
        }
    }
}

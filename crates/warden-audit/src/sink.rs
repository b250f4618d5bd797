//! The fire-and-forget `AuditSink` hook.

use crate::event::AuditPayload;
use crate::store::record_event;
use warden_db::DbPool;

/// Fire-and-forget observability hook.
///
/// `record` must never block or fail the caller: implementations log
/// failures and move on. The pipeline, ingress, and abuse engine call this
/// from hot paths.
pub trait AuditSink: Send + Sync {
    /// Records one audit event. Failures are swallowed and logged.
    fn record(
        &self,
        tenant_id: &str,
        payload: AuditPayload,
        subject_id: Option<&str>,
        actor_id: Option<&str>,
    );
}

/// `AuditSink` backed by the SQLite audit log.
///
/// Writes happen on a blocking task so the caller never waits on the
/// database; a failed write is logged as a warning and dropped.
#[derive(Clone)]
pub struct SqliteAuditSink {
    pool: DbPool,
}

impl SqliteAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(
        &self,
        tenant_id: &str,
        payload: AuditPayload,
        subject_id: Option<&str>,
        actor_id: Option<&str>,
    ) {
        let pool = self.pool.clone();
        let tenant_id = tenant_id.to_string();
        let subject_id = subject_id.map(str::to_string);
        let actor_id = actor_id.map(str::to_string);

        tokio::task::spawn_blocking(move || {
            let conn = match pool.get() {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(
                        event_type = payload.event_type(),
                        "audit sink could not get a connection: {}",
                        e
                    );
                    return;
                }
            };
            if let Err(e) = record_event(
                &conn,
                &tenant_id,
                &payload,
                subject_id.as_deref(),
                actor_id.as_deref(),
            ) {
                tracing::warn!(
                    event_type = payload.event_type(),
                    "failed to record audit event: {}",
                    e
                );
            }
        });
    }
}

/// `AuditSink` that drops everything. Used in tests and as a safe default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(
        &self,
        _tenant_id: &str,
        _payload: AuditPayload,
        _subject_id: Option<&str>,
        _actor_id: Option<&str>,
    ) {
    }
}

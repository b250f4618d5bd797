//! The network ingress: `POST /ingest/{credential}`.
//!
//! The handler does a fixed, small amount of work — resolve the tenant,
//! parse the envelope, suppress duplicates, enqueue — and acknowledges.
//! Downstream outcomes never change the acknowledgment; the platform's
//! retry behavior depends on that. The only non-2xx answer is the explicit
//! retryable queue-full response.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::Path;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use warden_audit::AuditPayload;
use warden_counters::CounterStore;
use warden_types::{EventKind, InboundEvent};

use crate::queue::{EnqueueError, QueuedEvent};
use crate::router::Resolution;
use crate::AppState;

/// The opaque JSON envelope the platform delivers.
#[derive(Debug, Deserialize)]
struct Envelope {
    /// Platform-assigned delivery id; doubles as the dedup key.
    update_id: i64,
    /// The conversation/group the event occurred in.
    chat_id: i64,
    /// The user who produced the event.
    user_id: i64,
    /// What happened.
    kind: EventKind,
    /// Opaque payload, passed through to modules.
    #[serde(default)]
    payload: Value,
    /// Platform-side timestamp (unix seconds). Unused by the gateway but
    /// accepted so envelopes pass validation unchanged.
    #[serde(default)]
    #[allow(dead_code)]
    sent_at: Option<i64>,
}

/// The fixed acknowledgment. Identical for processed, rejected, malformed,
/// and deduplicated deliveries.
fn ack() -> Response {
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

/// The explicit retryable response for a saturated queue.
fn retry_later() -> Response {
    let mut response = (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "ok": false, "retryable": true })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

/// Ingress handler.
pub async fn ingest_handler(
    Path(credential): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Response {
    // 1. Identity routing. Rejections are terminal but still acked, so a
    //    misconfigured tenant doesn't put the platform into a retry storm.
    let tenant = match state.router.resolve(&credential).await {
        Resolution::Resolved(tenant) => tenant,
        Resolution::Rejected(reason) => {
            tracing::debug!(reason = reason.as_str(), "ingress credential rejected");
            state
                .audit
                .record("-", AuditPayload::TenantRejected { reason }, None, None);
            return ack();
        }
    };

    // 2. Envelope parsing. Malformed input is logged, audited, dropped,
    //    and acked: the platform re-delivering the same bytes cannot help.
    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(
                tenant_id = %tenant.tenant_id,
                "malformed inbound envelope: {}",
                err
            );
            state.audit.record(
                &tenant.tenant_id,
                AuditPayload::EventMalformed {
                    detail: err.to_string(),
                },
                None,
                None,
            );
            return ack();
        }
    };

    let event = InboundEvent {
        tenant_id: tenant.tenant_id.clone(),
        subject_id: envelope.chat_id.to_string(),
        actor_id: envelope.user_id.to_string(),
        kind: envelope.kind,
        payload: envelope.payload,
        received_at: chrono::Utc::now().timestamp(),
        dedup_key: envelope.update_id.to_string(),
    };

    // 3. Duplicate-delivery suppression. The platform retries deliveries
    //    it considers unacknowledged; each (tenant, update_id) runs the
    //    pipeline once per TTL window.
    let dedup_key = format!("dd:{}:{}", event.tenant_id, event.dedup_key);
    match state
        .counters
        .set_once(&dedup_key, Duration::from_secs(state.policy.dedup_ttl_secs))
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(
                tenant_id = %event.tenant_id,
                dedup_key = %event.dedup_key,
                "duplicate delivery suppressed"
            );
            state.audit.record(
                &event.tenant_id,
                AuditPayload::EventDeduplicated {
                    dedup_key: event.dedup_key.clone(),
                },
                Some(&event.subject_id),
                Some(&event.actor_id),
            );
            return ack();
        }
        Err(err) => {
            // The failover store already absorbed backend trouble; an error
            // here is unexpected, and counting the event once more is the
            // lesser evil versus dropping it.
            tracing::error!("dedup check failed, processing anyway: {}", err);
        }
    }

    // 4. Enqueue for the pipeline workers.
    let trace_id = uuid::Uuid::new_v4();
    tracing::debug!(
        trace_id = %trace_id,
        tenant_id = %event.tenant_id,
        kind = %event.kind,
        "accepted inbound event"
    );
    match state.queue.try_enqueue(QueuedEvent {
        event,
        tenant,
        trace_id,
    }) {
        Ok(()) => ack(),
        Err(EnqueueError::Saturated { capacity }) => {
            tracing::warn!(capacity, "event queue saturated, refusing work");
            // The refused delivery will be retried; release its dedup flag
            // so the retry is not mistaken for a duplicate.
            let _ = state.counters.forget(&dedup_key).await;
            state.audit.record(
                "-",
                AuditPayload::QueueSaturated { capacity },
                None,
                None,
            );
            retry_later()
        }
        Err(EnqueueError::Closed) => {
            tracing::warn!("event queue closed, shutting down");
            let _ = state.counters.forget(&dedup_key).await;
            retry_later()
        }
    }
}

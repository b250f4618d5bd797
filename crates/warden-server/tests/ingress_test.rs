//! Ingress behavior: fixed acknowledgment, identity rejection, malformed
//! drops, duplicate suppression, and queue saturation.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use common::{envelope, post_raw, request, seed_tenant, setup, wait_for_audit_event};
use warden_server::config::Config;
use warden_types::EventKind;

#[tokio::test]
async fn health_check_returns_ok() {
    let gw = setup(Config::default());

    let (status, body) = request(&gw.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn valid_event_is_acked_and_enqueued() {
    let mut gw = setup(Config::default());
    seed_tenant(&gw.state, "tenant-1", "cred-1");

    let (status, body) = request(
        &gw.app,
        "POST",
        "/ingest/cred-1",
        None,
        Some(envelope(42, "message", json!({"text": "hello"}))),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    // The event reached the queue with the envelope mapped onto it.
    let queued = gw
        .queue_rx
        .as_mut()
        .expect("rx")
        .try_recv()
        .expect("event should be enqueued");
    assert_eq!(queued.event.tenant_id, "tenant-1");
    assert_eq!(queued.event.subject_id, "-100");
    assert_eq!(queued.event.actor_id, "7");
    assert_eq!(queued.event.kind, EventKind::Message);
    assert_eq!(queued.event.dedup_key, "42");
    assert_eq!(queued.tenant.tenant_id, "tenant-1");
}

#[tokio::test]
async fn unknown_credential_is_acked_and_dropped() {
    let mut gw = setup(Config::default());

    let (status, body) = request(
        &gw.app,
        "POST",
        "/ingest/not-a-credential",
        None,
        Some(envelope(1, "message", json!({"text": "hi"}))),
    )
    .await;

    // The platform still gets its fixed acknowledgment.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    // Nothing entered the queue: no pipeline stage will ever run.
    assert!(gw.queue_rx.as_mut().expect("rx").try_recv().is_err());

    // The rejection is visible in the audit log.
    wait_for_audit_event(&gw.state, "-", "TENANT_REJECTED").await;
}

#[tokio::test]
async fn suspended_tenant_is_acked_and_dropped() {
    let mut gw = setup(Config::default());
    {
        let conn = gw.state.pool.get().expect("conn");
        warden_server::stores::insert_tenant(
            &conn,
            "tenant-s",
            "cred-s",
            warden_types::TenantStatus::Suspended,
        )
        .expect("insert");
    }

    let (status, _) = request(
        &gw.app,
        "POST",
        "/ingest/cred-s",
        None,
        Some(envelope(1, "message", json!({"text": "hi"}))),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(gw.queue_rx.as_mut().expect("rx").try_recv().is_err());
}

#[tokio::test]
async fn malformed_envelope_is_acked_logged_and_dropped() {
    let mut gw = setup(Config::default());
    seed_tenant(&gw.state, "tenant-1", "cred-1");

    let (status, body) = post_raw(&gw.app, "/ingest/cred-1", "{definitely not json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    // Unknown event kinds are malformed too.
    let (status, _) = request(
        &gw.app,
        "POST",
        "/ingest/cred-1",
        None,
        Some(envelope(2, "telepathy", json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert!(gw.queue_rx.as_mut().expect("rx").try_recv().is_err());
    wait_for_audit_event(&gw.state, "tenant-1", "EVENT_MALFORMED").await;
}

#[tokio::test]
async fn duplicate_delivery_is_suppressed() {
    let mut gw = setup(Config::default());
    seed_tenant(&gw.state, "tenant-1", "cred-1");

    for _ in 0..2 {
        let (status, body) = request(
            &gw.app,
            "POST",
            "/ingest/cred-1",
            None,
            Some(envelope(77, "message", json!({"text": "retry me"}))),
        )
        .await;
        // Both deliveries get the same acknowledgment.
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    // Exactly one pipeline run's worth of work was enqueued.
    let rx = gw.queue_rx.as_mut().expect("rx");
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());

    wait_for_audit_event(&gw.state, "tenant-1", "EVENT_DEDUPLICATED").await;
}

#[tokio::test]
async fn saturated_queue_answers_retryable() {
    let mut config = Config::default();
    config.policy.queue_capacity = 2;
    let gw = setup(config);
    seed_tenant(&gw.state, "tenant-1", "cred-1");

    // No workers are draining; two events fill the queue.
    for update_id in 1..=2 {
        let (status, _) = request(
            &gw.app,
            "POST",
            "/ingest/cred-1",
            None,
            Some(envelope(update_id, "message", json!({"text": "x"}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // The third is refused with an explicit retryable response.
    let response = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ingest/cred-1")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    envelope(3, "message", json!({"text": "x"})).to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["ok"], false);
    assert_eq!(body["retryable"], true);

    wait_for_audit_event(&gw.state, "-", "QUEUE_SATURATED").await;
}

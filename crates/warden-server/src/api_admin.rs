//! Admin API handlers: the operator collaborator's surface.
//!
//! All routes here sit behind [`operator_auth_middleware`], which requires
//! the configured bearer operator token. With no token configured the
//! admin API refuses everything.

use axum::body::Body;
use axum::extract::{Path, Query};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

use warden_audit::{query_events, AuditDomain, AuditFilter, AuditPayload};
use warden_modules::BindingKey;
use warden_types::{ConfigStore, GroupConfig};

use crate::bindings::{disable_binding, insert_binding, list_bindings, BindingError};
use crate::stores::{list_tenants, upsert_group_config};
use crate::AppState;

/// API error envelope, rendered as `{"error": "..."}` with a status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

/// Middleware requiring `Authorization: Bearer <operator_token>`.
pub async fn operator_auth_middleware(
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let Some(expected) = state.operator_token.as_deref() else {
        // No token configured means the admin surface is disabled.
        return Err(StatusCode::UNAUTHORIZED);
    };

    let presented = req
        .headers()
        .get("Authorization")
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

// ── Mitigations ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MitigationListQuery {
    pub tenant_id: Option<String>,
}

/// Handler for `GET /api/admin/mitigations`.
pub async fn list_mitigations_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<MitigationListQuery>,
) -> Result<Response, ApiError> {
    let pool = state.pool.clone();
    let records = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
        warden_abuse::list_active(&conn, query.tenant_id.as_deref())
            .map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))??;

    Ok(Json(json!({ "mitigations": records })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ReverseRequest {
    /// Who is reversing, recorded in the audit log.
    pub operator: String,
}

/// Handler for `POST /api/admin/mitigations/{id}/reverse`.
///
/// The manual Cooldown→Normal transition: cancels the pending expiry timer
/// and lifts the platform action. Reversing an already-resolved record
/// reports `reversed: false` rather than erroring, matching the engine's
/// no-op semantics.
pub async fn reverse_mitigation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(record_id): Path<i64>,
    Json(request): Json<ReverseRequest>,
) -> Result<Response, ApiError> {
    if request.operator.trim().is_empty() {
        return Err(ApiError::BadRequest("operator must not be empty".into()));
    }

    let known = {
        let pool = state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
            warden_abuse::lookup_mitigation(&conn, record_id)
                .map_err(|e| ApiError::InternalServerError(e.to_string()))
        })
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))??
    };

    if known.is_none() {
        return Err(ApiError::NotFound(format!(
            "no mitigation record {record_id}"
        )));
    }

    let reversed = state
        .engine
        .reverse(record_id, &request.operator)
        .await
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?;

    Ok(Json(json!({ "reversed": reversed })).into_response())
}

// ── Audit log ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub tenant_id: String,
    pub domain: Option<String>,
    pub event_type: Option<String>,
    pub subject_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<i64>,
}

/// Handler for `GET /api/admin/audit`.
pub async fn query_audit_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Response, ApiError> {
    let domain = query
        .domain
        .as_deref()
        .map(AuditDomain::from_str)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let filter = AuditFilter {
        domain,
        event_type: query.event_type,
        subject_id: query.subject_id,
        actor_id: None,
        since: query.since,
        limit: query.limit,
    };

    let pool = state.pool.clone();
    let tenant_id = query.tenant_id;
    let events = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
        query_events(&conn, &tenant_id, &filter)
            .map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))??;

    Ok(Json(json!({ "events": events })).into_response())
}

// ── Tenants ──────────────────────────────────────────────────────────

/// Handler for `GET /api/admin/tenants`.
///
/// Registrations are written by the out-of-band registration collaborator;
/// the gateway exposes them read-only.
pub async fn list_tenants_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let pool = state.pool.clone();
    let tenants = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
        list_tenants(&conn).map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))??;

    // secret_hash stays server-side.
    let tenants: Vec<_> = tenants
        .into_iter()
        .map(|t| {
            json!({
                "tenant_id": t.tenant_id,
                "status": t.status,
                "created_at": t.created_at,
            })
        })
        .collect();

    Ok(Json(json!({ "tenants": tenants })).into_response())
}

// ── Module bindings ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BindingListQuery {
    pub tenant_id: Option<String>,
}

/// Handler for `GET /api/admin/bindings`.
pub async fn list_bindings_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<BindingListQuery>,
) -> Result<Response, ApiError> {
    let pool = state.pool.clone();
    let rows = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
        list_bindings(&conn, query.tenant_id.as_deref())
            .map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))??;

    Ok(Json(json!({ "bindings": rows })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RegisterBindingRequest {
    pub tenant_id: String,
    pub match_key: String,
    pub module_id: String,
}

/// Handler for `POST /api/admin/bindings`.
///
/// Registers in the in-memory registry first (cheap conflict check), then
/// persists the row. A persistence conflict rolls the registry back so the
/// two layers stay consistent.
pub async fn register_binding_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RegisterBindingRequest>,
) -> Result<Response, ApiError> {
    let key = BindingKey::parse(&request.match_key).ok_or_else(|| {
        ApiError::BadRequest(format!("unparsable match key '{}'", request.match_key))
    })?;
    let module = state.catalog.get(&request.module_id).ok_or_else(|| {
        ApiError::BadRequest(format!("unknown module '{}'", request.module_id))
    })?;

    state
        .registry
        .register(&request.tenant_id, key.clone(), module.clone())
        .map_err(|e| ApiError::Conflict(e.to_string()))?;

    let pool = state.pool.clone();
    let tenant_id = request.tenant_id.clone();
    let match_key = request.match_key.clone();
    let module_id = request.module_id.clone();
    let inserted = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
        insert_binding(&conn, &tenant_id, &match_key, &module_id).map_err(|e| match e {
            BindingError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            BindingError::Database(e) => ApiError::InternalServerError(e.to_string()),
        })
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))?;

    let row = match inserted {
        Ok(row) => row,
        Err(err) => {
            state.registry.disable(&request.tenant_id, &key);
            return Err(err);
        }
    };

    state.audit.record(
        &request.tenant_id,
        AuditPayload::BindingRegistered {
            match_key: request.match_key.clone(),
            module_id: request.module_id.clone(),
        },
        None,
        None,
    );

    Ok((StatusCode::CREATED, Json(json!({ "binding": row }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DisableBindingRequest {
    pub tenant_id: String,
    pub match_key: String,
}

/// Handler for `DELETE /api/admin/bindings`.
pub async fn disable_binding_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<DisableBindingRequest>,
) -> Result<Response, ApiError> {
    let key = BindingKey::parse(&request.match_key).ok_or_else(|| {
        ApiError::BadRequest(format!("unparsable match key '{}'", request.match_key))
    })?;

    let pool = state.pool.clone();
    let tenant_id = request.tenant_id.clone();
    let match_key = request.match_key.clone();
    let disabled = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
        disable_binding(&conn, &tenant_id, &match_key)
            .map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))??;

    state.registry.disable(&request.tenant_id, &key);

    if !disabled {
        return Err(ApiError::NotFound(format!(
            "no enabled binding for ({}, {})",
            request.tenant_id, request.match_key
        )));
    }

    state.audit.record(
        &request.tenant_id,
        AuditPayload::BindingDisabled {
            match_key: request.match_key.clone(),
        },
        None,
        None,
    );

    Ok(Json(json!({ "disabled": true })).into_response())
}

// ── Group configuration ──────────────────────────────────────────────

/// Handler for `GET /api/admin/groups/{tenantId}/{subjectId}`.
pub async fn get_group_config_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((tenant_id, subject_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let config = state
        .config_store
        .group_config(&tenant_id, &subject_id)
        .await
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?;

    Ok(Json(json!({ "config": config })).into_response())
}

/// Handler for `PUT /api/admin/groups/{tenantId}/{subjectId}`.
pub async fn put_group_config_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((tenant_id, subject_id)): Path<(String, String)>,
    Json(config): Json<GroupConfig>,
) -> Result<Response, ApiError> {
    let pool = state.pool.clone();
    let stored = config.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
        upsert_group_config(&conn, &tenant_id, &subject_id, &stored)
            .map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))??;

    Ok(Json(json!({ "config": config })).into_response())
}

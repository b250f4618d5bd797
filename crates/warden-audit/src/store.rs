//! Persistence operations for the audit log.
//!
//! All writes go through [`record_event`], which serialises the payload,
//! assigns a monotonically increasing per-tenant sequence number, and
//! inserts into the `audit_log` table in a single statement.
//!
//! Reads go through [`query_events`], which supports filtering by domain,
//! event type, subject, and time range with cursor-based pagination.

use rusqlite::{params, Connection};

use crate::error::AuditError;
use crate::event::{AuditDomain, AuditPayload, AuditRecord};

/// Writes a single event to the audit log.
///
/// The caller supplies the tenant, a structured payload, and the optional
/// subject/actor the event concerns. Domain and event type are derived from
/// the payload; a monotonically increasing sequence number is assigned
/// atomically inside the INSERT.
///
/// # Errors
///
/// Returns `AuditError::Database` on SQL failure or
/// `AuditError::Serialization` if the payload cannot be serialised.
pub fn record_event(
    conn: &Connection,
    tenant_id: &str,
    payload: &AuditPayload,
    subject_id: Option<&str>,
    actor_id: Option<&str>,
) -> Result<AuditRecord, AuditError> {
    let payload_json = serde_json::to_string(payload)?;
    let domain = payload.domain();

    // Atomically assign the sequence number and insert in a single
    // statement. The subquery computes COALESCE(MAX(seq), 0) + 1 within the
    // same INSERT, eliminating the read-modify-write race where two
    // concurrent writers could observe the same MAX(seq) and produce
    // duplicate sequence numbers.
    let row = conn.query_row(
        "INSERT INTO audit_log
            (tenant_id, domain, event_type, subject_id, actor_id, seq, payload_json, occurred_at)
         VALUES (
            ?1, ?2, ?3, ?4, ?5,
            (SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_log WHERE tenant_id = ?1),
            ?6,
            datetime('now')
         )
         RETURNING id, seq, occurred_at",
        params![
            tenant_id,
            domain.as_str(),
            payload.event_type(),
            subject_id,
            actor_id,
            payload_json,
        ],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        },
    )?;

    let (id, seq, occurred_at) = row;

    Ok(AuditRecord {
        id,
        tenant_id: tenant_id.to_string(),
        domain: domain.as_str().to_string(),
        event_type: payload.event_type().to_string(),
        subject_id: subject_id.map(str::to_string),
        actor_id: actor_id.map(str::to_string),
        seq,
        payload_json,
        occurred_at,
    })
}

/// Returns the next sequence number for the given tenant.
///
/// Sequence numbers are monotonically increasing per tenant and order the
/// tenant's audit stream.
///
/// # Errors
///
/// Returns `AuditError::Database` on SQL failure.
pub fn next_seq(conn: &Connection, tenant_id: &str) -> Result<i64, AuditError> {
    let max_seq: Option<i64> = conn.query_row(
        "SELECT MAX(seq) FROM audit_log WHERE tenant_id = ?1",
        params![tenant_id],
        |row| row.get(0),
    )?;
    Ok(max_seq.unwrap_or(0) + 1)
}

/// Filter criteria for querying the audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Filter by audit domain.
    pub domain: Option<AuditDomain>,
    /// Filter by event type string.
    pub event_type: Option<String>,
    /// Filter by subject.
    pub subject_id: Option<String>,
    /// Filter by actor.
    pub actor_id: Option<String>,
    /// Return events that occurred at or after this ISO 8601 timestamp.
    pub since: Option<String>,
    /// Maximum number of events to return (default: 100).
    pub limit: Option<i64>,
}

/// Queries the audit log with optional filters.
///
/// Results are returned in sequence order (oldest first), bounded by
/// `filter.limit` (default 100). Use `filter.since` for cursor-based
/// pagination.
///
/// # Errors
///
/// Returns `AuditError::Database` on SQL failure.
pub fn query_events(
    conn: &Connection,
    tenant_id: &str,
    filter: &AuditFilter,
) -> Result<Vec<AuditRecord>, AuditError> {
    // Build a parameterised query dynamically. WHERE clauses and bind
    // parameters are collected separately so nothing is interpolated.
    let mut clauses = vec!["tenant_id = ?1".to_string()];
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> =
        vec![Box::new(tenant_id.to_string())];
    let mut idx = 2u32;

    if let Some(ref domain) = filter.domain {
        clauses.push(format!("domain = ?{idx}"));
        param_values.push(Box::new(domain.as_str().to_string()));
        idx += 1;
    }

    if let Some(ref et) = filter.event_type {
        clauses.push(format!("event_type = ?{idx}"));
        param_values.push(Box::new(et.clone()));
        idx += 1;
    }

    if let Some(ref subject) = filter.subject_id {
        clauses.push(format!("subject_id = ?{idx}"));
        param_values.push(Box::new(subject.clone()));
        idx += 1;
    }

    if let Some(ref actor) = filter.actor_id {
        clauses.push(format!("actor_id = ?{idx}"));
        param_values.push(Box::new(actor.clone()));
        idx += 1;
    }

    if let Some(ref since) = filter.since {
        clauses.push(format!("occurred_at >= ?{idx}"));
        param_values.push(Box::new(since.clone()));
        idx += 1;
    }

    let limit = filter.limit.unwrap_or(100);
    let where_clause = clauses.join(" AND ");
    let sql = format!(
        "SELECT id, tenant_id, domain, event_type, subject_id, actor_id, seq, payload_json, occurred_at
         FROM audit_log
         WHERE {where_clause}
         ORDER BY seq ASC
         LIMIT ?{idx}"
    );

    param_values.push(Box::new(limit));

    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| &**p).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        Ok(AuditRecord {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            domain: row.get(2)?,
            event_type: row.get(3)?,
            subject_id: row.get(4)?,
            actor_id: row.get(5)?,
            seq: row.get(6)?,
            payload_json: row.get(7)?,
            occurred_at: row.get(8)?,
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }

    Ok(events)
}

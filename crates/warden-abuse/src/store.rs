//! Persistence for mitigation records.
//!
//! The `mitigations` table carries a partial unique index over active
//! records (`tenant, subject, actor, action WHERE status = 'active'`), so
//! [`insert_active`] doubles as the idempotence gate: inserting while a
//! matching active record exists is a no-op, and exactly one of any number
//! of concurrent writers observes the insert.

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use warden_db::DbPool;
use warden_types::{AbuseCategory, MitigationAction};

use crate::error::AbuseError;

/// Lifecycle status of a mitigation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationStatus {
    /// The mitigation is in force; an expiry timer may be pending.
    Active,
    /// The expiry timer fired and the action was reversed.
    Expired,
    /// An operator reversed the action before expiry.
    Reversed,
}

impl MitigationStatus {
    /// Returns the canonical string label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Reversed => "reversed",
        }
    }

    fn from_label(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "reversed" => Some(Self::Reversed),
            _ => None,
        }
    }
}

/// Parameters for creating a mitigation record.
#[derive(Debug, Clone)]
pub struct NewMitigation {
    pub tenant_id: String,
    pub subject_id: String,
    /// Absent for subject-wide mitigations (raid lock).
    pub actor_id: Option<String>,
    pub action: MitigationAction,
    pub cause: AbuseCategory,
    /// `None` for indefinite mitigations (no expiry timer).
    pub duration: Option<Duration>,
}

/// One row from the `mitigations` table.
#[derive(Debug, Clone, Serialize)]
pub struct MitigationRecord {
    pub id: i64,
    pub tenant_id: String,
    pub subject_id: String,
    pub actor_id: Option<String>,
    pub action: MitigationAction,
    pub cause: AbuseCategory,
    pub status: MitigationStatus,
    /// ISO 8601 timestamp of the trigger.
    pub triggered_at: String,
    /// ISO 8601 timestamp of scheduled reversal, if time-bounded.
    pub expires_at: Option<String>,
    /// Seconds until `expires_at`, negative if overdue. Computed at read
    /// time; used to rebuild expiry timers after a restart.
    pub remaining_secs: Option<i64>,
}

type RawRow = (
    i64,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
);

const SELECT_COLUMNS: &str = "id, tenant_id, subject_id, actor_id, action, cause, status, \
     triggered_at, expires_at, \
     CAST(ROUND((julianday(expires_at) - julianday('now')) * 86400) AS INTEGER)";

fn map_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn convert(raw: RawRow) -> Result<MitigationRecord, AbuseError> {
    let (id, tenant_id, subject_id, actor_id, action, cause, status, triggered_at, expires_at, remaining_secs) =
        raw;

    let action = MitigationAction::from_str_opt(&action).ok_or_else(|| AbuseError::CorruptRecord {
        id,
        detail: format!("unknown action '{action}'"),
    })?;
    let cause = AbuseCategory::from_str_opt(&cause).ok_or_else(|| AbuseError::CorruptRecord {
        id,
        detail: format!("unknown cause '{cause}'"),
    })?;
    let status = MitigationStatus::from_label(&status).ok_or_else(|| AbuseError::CorruptRecord {
        id,
        detail: format!("unknown status '{status}'"),
    })?;

    Ok(MitigationRecord {
        id,
        tenant_id,
        subject_id,
        actor_id,
        action,
        cause,
        status,
        triggered_at,
        expires_at,
        remaining_secs,
    })
}

/// Inserts an active mitigation record, unless one with the same
/// action+target is already active.
///
/// Returns `Ok(None)` when an active record already exists — the caller
/// must treat that as "already mitigated, apply nothing".
pub fn insert_active(
    conn: &Connection,
    new: &NewMitigation,
) -> Result<Option<MitigationRecord>, AbuseError> {
    let expiry_modifier = new
        .duration
        .map(|d| format!("+{} seconds", d.as_secs()));

    let raw = conn
        .query_row(
            "INSERT OR IGNORE INTO mitigations
                (tenant_id, subject_id, actor_id, action, cause, status, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active',
                     CASE WHEN ?6 IS NULL THEN NULL ELSE datetime('now', ?6) END)
             RETURNING id, tenant_id, subject_id, actor_id, action, cause, status,
                       triggered_at, expires_at,
                       CAST(ROUND((julianday(expires_at) - julianday('now')) * 86400) AS INTEGER)",
            params![
                new.tenant_id,
                new.subject_id,
                new.actor_id,
                new.action.as_str(),
                new.cause.as_str(),
                expiry_modifier,
            ],
            map_raw,
        )
        .optional()?;

    raw.map(convert).transpose()
}

/// Moves an active mitigation to a terminal status.
///
/// Returns `false` if the record was not active — the expiry timer and a
/// manual reversal may race, and exactly one of them wins this update.
pub fn resolve_mitigation(
    conn: &Connection,
    id: i64,
    status: MitigationStatus,
) -> Result<bool, AbuseError> {
    let changed = conn.execute(
        "UPDATE mitigations SET status = ?2 WHERE id = ?1 AND status = 'active'",
        params![id, status.as_str()],
    )?;
    Ok(changed == 1)
}

/// Fetches one mitigation record by id.
pub fn lookup_mitigation(
    conn: &Connection,
    id: i64,
) -> Result<Option<MitigationRecord>, AbuseError> {
    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM mitigations WHERE id = ?1"),
            params![id],
            map_raw,
        )
        .optional()?;
    raw.map(convert).transpose()
}

/// Lists active mitigations, optionally scoped to one tenant.
///
/// Used by the admin API and, at startup, to rebuild expiry timers for
/// mitigations that were pending when the process stopped.
pub fn list_active(
    conn: &Connection,
    tenant_id: Option<&str>,
) -> Result<Vec<MitigationRecord>, AbuseError> {
    let sql = match tenant_id {
        Some(_) => format!(
            "SELECT {SELECT_COLUMNS} FROM mitigations
             WHERE status = 'active' AND tenant_id = ?1 ORDER BY id ASC"
        ),
        None => format!(
            "SELECT {SELECT_COLUMNS} FROM mitigations WHERE status = 'active' ORDER BY id ASC"
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let raws: Vec<RawRow> = match tenant_id {
        Some(tenant) => stmt
            .query_map(params![tenant], map_raw)?
            .collect::<rusqlite::Result<_>>()?,
        None => stmt
            .query_map([], map_raw)?
            .collect::<rusqlite::Result<_>>()?,
    };

    raws.into_iter().map(convert).collect()
}

/// Async port over the mitigation record store.
///
/// The SQLite implementation below is the production one; tests either use
/// it against an in-memory pool or substitute their own.
#[async_trait::async_trait]
pub trait MitigationStore: Send + Sync {
    /// See [`insert_active`].
    async fn insert_active(
        &self,
        new: NewMitigation,
    ) -> Result<Option<MitigationRecord>, AbuseError>;

    /// See [`resolve_mitigation`].
    async fn resolve(&self, id: i64, status: MitigationStatus) -> Result<bool, AbuseError>;

    /// See [`lookup_mitigation`].
    async fn lookup(&self, id: i64) -> Result<Option<MitigationRecord>, AbuseError>;

    /// See [`list_active`].
    async fn list_active(
        &self,
        tenant_id: Option<String>,
    ) -> Result<Vec<MitigationRecord>, AbuseError>;
}

/// `MitigationStore` backed by the pooled SQLite database.
///
/// Every call runs on a blocking task; the pipeline workers never block on
/// database I/O directly.
#[derive(Clone)]
pub struct SqliteMitigationStore {
    pool: DbPool,
}

impl SqliteMitigationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MitigationStore for SqliteMitigationStore {
    async fn insert_active(
        &self,
        new: NewMitigation,
    ) -> Result<Option<MitigationRecord>, AbuseError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            insert_active(&conn, &new)
        })
        .await?
    }

    async fn resolve(&self, id: i64, status: MitigationStatus) -> Result<bool, AbuseError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            resolve_mitigation(&conn, id, status)
        })
        .await?
    }

    async fn lookup(&self, id: i64) -> Result<Option<MitigationRecord>, AbuseError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            lookup_mitigation(&conn, id)
        })
        .await?
    }

    async fn list_active(
        &self,
        tenant_id: Option<String>,
    ) -> Result<Vec<MitigationRecord>, AbuseError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            list_active(&conn, tenant_id.as_deref())
        })
        .await?
    }
}

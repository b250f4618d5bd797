//! Module binding persistence and startup loading.
//!
//! The `module_bindings` table is the durable source of truth; the
//! in-memory [`ModuleRegistry`] is rebuilt from it at startup and kept in
//! step by the admin API. The table's partial unique index and the
//! registry's registration check enforce the same invariant at both
//! layers: one enabled binding per (tenant, match).

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, Connection};
use serde::Serialize;
use warden_modules::{BindingKey, Module, ModuleRegistry};

/// Known module implementations, keyed by module id.
///
/// Bindings may only reference modules present here; the catalog is
/// assembled at startup from the handler crates linked into the binary.
pub type ModuleCatalog = HashMap<String, Arc<dyn Module>>;

/// One row from the `module_bindings` table.
#[derive(Debug, Clone, Serialize)]
pub struct BindingRow {
    pub id: i64,
    pub tenant_id: String,
    pub match_key: String,
    pub module_id: String,
    pub enabled: bool,
    pub created_at: String,
}

/// Errors from binding persistence.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    /// An enabled binding for this (tenant, match) already exists.
    #[error("conflicting enabled binding for ({tenant_id}, {match_key})")]
    Conflict {
        tenant_id: String,
        match_key: String,
    },

    /// A database operation failed.
    #[error("binding database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Inserts an enabled binding row.
///
/// The partial unique index turns a duplicate into
/// [`BindingError::Conflict`] — detected here, at registration time, never
/// at dispatch time.
pub fn insert_binding(
    conn: &Connection,
    tenant_id: &str,
    match_key: &str,
    module_id: &str,
) -> Result<BindingRow, BindingError> {
    let result = conn.query_row(
        "INSERT INTO module_bindings (tenant_id, match_key, module_id, enabled)
         VALUES (?1, ?2, ?3, 1)
         RETURNING id, tenant_id, match_key, module_id, enabled, created_at",
        params![tenant_id, match_key, module_id],
        map_binding_row,
    );

    match result {
        Ok(row) => Ok(row),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(BindingError::Conflict {
                tenant_id: tenant_id.to_string(),
                match_key: match_key.to_string(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

/// Disables the enabled binding for (tenant, match). Returns `false` if
/// none was enabled.
pub fn disable_binding(
    conn: &Connection,
    tenant_id: &str,
    match_key: &str,
) -> Result<bool, BindingError> {
    let changed = conn.execute(
        "UPDATE module_bindings SET enabled = 0
         WHERE tenant_id = ?1 AND match_key = ?2 AND enabled = 1",
        params![tenant_id, match_key],
    )?;
    Ok(changed == 1)
}

/// Lists binding rows, optionally scoped to one tenant.
pub fn list_bindings(
    conn: &Connection,
    tenant_id: Option<&str>,
) -> Result<Vec<BindingRow>, BindingError> {
    let sql_all = "SELECT id, tenant_id, match_key, module_id, enabled, created_at
                   FROM module_bindings ORDER BY tenant_id, match_key";
    let sql_one = "SELECT id, tenant_id, match_key, module_id, enabled, created_at
                   FROM module_bindings WHERE tenant_id = ?1 ORDER BY match_key";

    let rows = match tenant_id {
        Some(tenant) => {
            let mut stmt = conn.prepare(sql_one)?;
            let rows = stmt.query_map(params![tenant], map_binding_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
        None => {
            let mut stmt = conn.prepare(sql_all)?;
            let rows = stmt.query_map([], map_binding_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
    };
    Ok(rows)
}

fn map_binding_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BindingRow> {
    Ok(BindingRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        match_key: row.get(2)?,
        module_id: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

/// Rebuilds the in-memory registry from the enabled binding rows.
///
/// Rows referencing modules missing from the catalog or carrying an
/// unparsable match key are logged and skipped; one bad row must not keep
/// the gateway from starting.
pub fn load_registry(
    conn: &Connection,
    catalog: &ModuleCatalog,
    registry: &ModuleRegistry,
) -> Result<usize, BindingError> {
    let mut loaded = 0;

    for row in list_bindings(conn, None)? {
        if !row.enabled {
            continue;
        }
        let Some(key) = BindingKey::parse(&row.match_key) else {
            tracing::warn!(
                tenant_id = %row.tenant_id,
                match_key = %row.match_key,
                "skipping binding with unparsable match key"
            );
            continue;
        };
        let Some(module) = catalog.get(&row.module_id) else {
            tracing::warn!(
                tenant_id = %row.tenant_id,
                module_id = %row.module_id,
                "skipping binding for module not in catalog"
            );
            continue;
        };
        match registry.register(&row.tenant_id, key, module.clone()) {
            Ok(()) => loaded += 1,
            Err(err) => {
                // The unique index should make this impossible; a damaged
                // table must still not abort startup.
                tracing::error!(
                    tenant_id = %row.tenant_id,
                    "binding row conflicts with registry state: {}",
                    err
                );
            }
        }
    }

    Ok(loaded)
}

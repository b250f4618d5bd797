//! SQLite-backed implementations of the gateway's read-side ports.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use warden_db::DbPool;
use warden_types::{
    ConfigStore, GroupConfig, StoreError, TenantRegistration, TenantStatus, TenantStore,
};

/// Hex-encoded SHA-256 of an ingress credential.
///
/// Credentials never touch the database in the clear; the `tenants` table
/// stores only this digest, and resolution compares digests.
pub fn credential_hash(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

fn pool_err(e: r2d2::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> StoreError {
    StoreError::Query(e.to_string())
}

/// Reads one tenant registration by credential hash.
pub fn find_tenant_by_hash(
    conn: &Connection,
    secret_hash: &str,
) -> Result<Option<TenantRegistration>, rusqlite::Error> {
    conn.query_row(
        "SELECT tenant_id, secret_hash, status, created_at FROM tenants WHERE secret_hash = ?1",
        params![secret_hash],
        map_tenant_row,
    )
    .optional()
}

/// Lists all tenant registrations, newest first.
pub fn list_tenants(conn: &Connection) -> Result<Vec<TenantRegistration>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT tenant_id, secret_hash, status, created_at FROM tenants ORDER BY id DESC",
    )?;
    let rows = stmt.query_map([], map_tenant_row)?;
    rows.collect()
}

fn map_tenant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantRegistration> {
    let status_label: String = row.get(2)?;
    let status = TenantStatus::from_str_opt(&status_label).unwrap_or_else(|| {
        // An unknown status is treated as suspended: refusing traffic for a
        // mislabeled tenant is recoverable, serving it is not.
        tracing::warn!(status = %status_label, "unknown tenant status, treating as suspended");
        TenantStatus::Suspended
    });
    Ok(TenantRegistration {
        tenant_id: row.get(0)?,
        secret_hash: row.get(1)?,
        status,
        created_at: row.get(3)?,
    })
}

/// Upserts the stored group config for `(tenant, subject)`.
pub fn upsert_group_config(
    conn: &Connection,
    tenant_id: &str,
    subject_id: &str,
    config: &GroupConfig,
) -> Result<(), rusqlite::Error> {
    let config_json = serde_json::to_string(config).map_err(|e| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(e))
    })?;
    conn.execute(
        "INSERT INTO group_configs (tenant_id, subject_id, config_json, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT (tenant_id, subject_id)
         DO UPDATE SET config_json = excluded.config_json, updated_at = datetime('now')",
        params![tenant_id, subject_id, config_json],
    )?;
    Ok(())
}

/// `TenantStore` over the pooled SQLite database.
#[derive(Clone)]
pub struct SqliteTenantStore {
    pool: DbPool,
}

impl SqliteTenantStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TenantStore for SqliteTenantStore {
    async fn resolve(&self, credential: &str) -> Result<Option<TenantRegistration>, StoreError> {
        let pool = self.pool.clone();
        let hash = credential_hash(credential);
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(pool_err)?;
            find_tenant_by_hash(&conn, &hash).map_err(sql_err)
        })
        .await
        .map_err(join_err)?
    }
}

/// `ConfigStore` over the pooled SQLite database.
///
/// Subjects without a stored config — the common case — get the gateway's
/// default group config. A stored config that no longer parses is logged
/// and also falls back to the defaults rather than wedging the subject.
#[derive(Clone)]
pub struct SqliteConfigStore {
    pool: DbPool,
    defaults: GroupConfig,
}

impl SqliteConfigStore {
    pub fn new(pool: DbPool, defaults: GroupConfig) -> Self {
        Self { pool, defaults }
    }
}

#[async_trait::async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn group_config(
        &self,
        tenant_id: &str,
        subject_id: &str,
    ) -> Result<GroupConfig, StoreError> {
        let pool = self.pool.clone();
        let defaults = self.defaults.clone();
        let tenant_id = tenant_id.to_string();
        let subject_id = subject_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(pool_err)?;
            let stored: Option<String> = conn
                .query_row(
                    "SELECT config_json FROM group_configs
                     WHERE tenant_id = ?1 AND subject_id = ?2",
                    params![tenant_id, subject_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;

            match stored {
                Some(json) => match serde_json::from_str(&json) {
                    Ok(config) => Ok(config),
                    Err(e) => {
                        tracing::warn!(
                            tenant_id = %tenant_id,
                            subject_id = %subject_id,
                            "stored group config failed to parse, using defaults: {}",
                            e
                        );
                        Ok(defaults)
                    }
                },
                None => Ok(defaults),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn actor_banned(&self, tenant_id: &str, actor_id: &str) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        let tenant_id = tenant_id.to_string();
        let actor_id = actor_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(pool_err)?;
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM actor_bans WHERE tenant_id = ?1 AND actor_id = ?2)",
                params![tenant_id, actor_id],
                |row| row.get(0),
            )
            .map_err(sql_err)
        })
        .await
        .map_err(join_err)?
    }
}

/// Inserts a tenant registration. Intended for the registration
/// collaborator and tests; the gateway itself never writes tenants.
pub fn insert_tenant(
    conn: &Connection,
    tenant_id: &str,
    credential: &str,
    status: TenantStatus,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO tenants (tenant_id, secret_hash, status) VALUES (?1, ?2, ?3)",
        params![tenant_id, credential_hash(credential), status.as_str()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_db::{create_pool, run_migrations, DbRuntimeSettings};

    fn test_pool() -> DbPool {
        let pool = create_pool(
            ":memory:",
            DbRuntimeSettings {
                busy_timeout_ms: 1_000,
                pool_max_size: 1,
            },
        )
        .expect("pool");
        run_migrations(&pool.get().expect("conn")).expect("migrations");
        pool
    }

    #[tokio::test]
    async fn tenant_resolution_is_hash_based_and_deterministic() {
        let pool = test_pool();
        insert_tenant(
            &pool.get().expect("conn"),
            "tenant-1",
            "secret-credential",
            TenantStatus::Active,
        )
        .expect("insert");

        let store = SqliteTenantStore::new(pool);

        for _ in 0..3 {
            let resolved = store
                .resolve("secret-credential")
                .await
                .expect("resolve")
                .expect("should resolve");
            assert_eq!(resolved.tenant_id, "tenant-1");
            assert_eq!(resolved.status, TenantStatus::Active);
        }

        assert!(store.resolve("wrong").await.expect("resolve").is_none());
    }

    #[tokio::test]
    async fn group_config_falls_back_to_defaults() {
        let pool = test_pool();
        let mut defaults = GroupConfig::default();
        defaults.rate_limit.capacity = 7;
        let store = SqliteConfigStore::new(pool.clone(), defaults);

        let config = store.group_config("t1", "-1").await.expect("load");
        assert_eq!(config.rate_limit.capacity, 7);

        // A stored config overrides the defaults.
        let mut stored = GroupConfig::default();
        stored.rate_limit.capacity = 3;
        upsert_group_config(&pool.get().expect("conn"), "t1", "-1", &stored).expect("upsert");

        let config = store.group_config("t1", "-1").await.expect("load");
        assert_eq!(config.rate_limit.capacity, 3);

        // Other subjects still see defaults.
        let config = store.group_config("t1", "-2").await.expect("load");
        assert_eq!(config.rate_limit.capacity, 7);
    }

    #[tokio::test]
    async fn actor_bans_are_tenant_scoped() {
        let pool = test_pool();
        pool.get()
            .expect("conn")
            .execute(
                "INSERT INTO actor_bans (tenant_id, actor_id, reason) VALUES ('t1', 'u1', 'spam')",
                [],
            )
            .expect("insert ban");

        let store = SqliteConfigStore::new(pool, GroupConfig::default());
        assert!(store.actor_banned("t1", "u1").await.expect("check"));
        assert!(!store.actor_banned("t1", "u2").await.expect("check"));
        assert!(!store.actor_banned("t2", "u1").await.expect("check"));
    }
}

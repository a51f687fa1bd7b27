//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use custodian_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 3;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        3 => apply_v3(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: devices, licenses and content keys.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE devices (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            name TEXT NOT NULL,
            platform TEXT NOT NULL,             -- ios | android | desktop
            registered_at INTEGER NOT NULL,
            last_used_at INTEGER NOT NULL,
            revoked_at INTEGER                  -- tombstone
        );

        -- One active device per (user, fingerprint)
        CREATE UNIQUE INDEX idx_devices_active_fingerprint
            ON devices(user_id, fingerprint) WHERE revoked_at IS NULL;
        CREATE INDEX idx_devices_user ON devices(user_id);

        CREATE TABLE licenses (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            material_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            status TEXT NOT NULL,               -- active | revoked
            nonce TEXT NOT NULL,
            issued_at INTEGER NOT NULL,
            last_validated_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            grace_period_ms INTEGER NOT NULL,
            revoked_at INTEGER
        );

        -- At most one active license per triple
        CREATE UNIQUE INDEX idx_licenses_active_triple
            ON licenses(user_id, material_id, device_id) WHERE status = 'active';
        CREATE INDEX idx_licenses_device ON licenses(device_id);
        CREATE INDEX idx_licenses_material ON licenses(material_id);
        CREATE INDEX idx_licenses_user ON licenses(user_id);

        CREATE TABLE content_keys (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            material_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            wrapped_key BLOB NOT NULL,
            key_version INTEGER NOT NULL,
            created_at INTEGER NOT NULL,

            UNIQUE(user_id, material_id, device_id)
        );

        CREATE INDEX idx_content_keys_device ON content_keys(device_id);
        CREATE INDEX idx_content_keys_material ON content_keys(material_id);
        "#,
    )?;

    Ok(())
}

/// Migration v2: encryption jobs.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE encryption_jobs (
            id TEXT PRIMARY KEY,
            material_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            license_id TEXT NOT NULL,
            priority INTEGER NOT NULL,          -- 1=high, 2=normal, 3=low
            status TEXT NOT NULL,               -- pending | processing | completed | failed
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            error_message TEXT
        );

        CREATE INDEX idx_jobs_queue ON encryption_jobs(status, priority, created_at);
        CREATE INDEX idx_jobs_material ON encryption_jobs(material_id, created_at);
        CREATE INDEX idx_jobs_license ON encryption_jobs(license_id, created_at);
        CREATE INDEX idx_jobs_completed ON encryption_jobs(status, completed_at);
        "#,
    )?;

    Ok(())
}

/// Migration v3: security audit log.
fn apply_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE audit_log (
            seq INTEGER PRIMARY KEY,            -- insertion order, breaks timestamp ties
            id TEXT NOT NULL UNIQUE,
            user_id TEXT,
            device_id TEXT,
            action TEXT NOT NULL,               -- e.g. license.validate
            resource_id TEXT NOT NULL,
            success INTEGER NOT NULL,
            error_code TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX idx_audit_user ON audit_log(user_id, created_at);
        CREATE INDEX idx_audit_device ON audit_log(device_id, created_at);
        "#,
    )?;

    Ok(())
}

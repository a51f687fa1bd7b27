//! SQLite implementation of the repository traits.
//!
//! This is the persistent backend. It uses rusqlite with bundled SQLite,
//! wrapped in async via tokio::spawn_blocking. The connection sits behind one
//! mutex, so every call (and every transaction inside a call) is serialized.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params, Row};
use uuid::Uuid;

use custodian_core::{
    AuditRecord, CekId, ContentEncryptionKey, Device, DeviceId, EncryptionJob, Fingerprint, JobId,
    JobPriority, License, LicenseId, MaterialId, Nonce, UserId,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    AuditRepository, CekRepository, DeviceInsert, DeviceRepository, JobCounts, JobRepository,
    LicenseInsert, LicenseRepository,
};

const DEVICE_COLUMNS: &str =
    "id, user_id, fingerprint, name, platform, registered_at, last_used_at, revoked_at";

const LICENSE_COLUMNS: &str = "id, user_id, material_id, device_id, status, nonce, issued_at, \
     last_validated_at, expires_at, grace_period_ms, revoked_at";

const CEK_COLUMNS: &str =
    "id, user_id, material_id, device_id, wrapped_key, key_version, created_at";

const AUDIT_COLUMNS: &str =
    "id, user_id, device_id, action, resource_id, success, error_code, created_at";

const JOB_COLUMNS: &str = "id, material_id, user_id, device_id, license_id, priority, status, \
     retry_count, created_at, started_at, completed_at, error_message";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn get_id<T: From<Uuid>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map(T::from)
        .map_err(|e| conversion(idx, e))
}

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<Device> {
    let platform: String = row.get(4)?;
    Ok(Device {
        id: get_id(row, 0)?,
        user_id: get_id(row, 1)?,
        fingerprint: Fingerprint::from_raw(row.get::<_, String>(2)?),
        name: row.get(3)?,
        platform: platform.parse().map_err(|e| conversion(4, e))?,
        registered_at: row.get(5)?,
        last_used_at: row.get(6)?,
        revoked_at: row.get(7)?,
    })
}

fn row_to_license(row: &Row<'_>) -> rusqlite::Result<License> {
    let status: String = row.get(4)?;
    let grace_ms: i64 = row.get(9)?;
    Ok(License {
        id: get_id(row, 0)?,
        user_id: get_id(row, 1)?,
        material_id: get_id(row, 2)?,
        device_id: get_id(row, 3)?,
        status: status.parse().map_err(|e| conversion(4, e))?,
        nonce: Nonce::from_raw(row.get::<_, String>(5)?),
        issued_at: row.get(6)?,
        last_validated_at: row.get(7)?,
        expires_at: row.get(8)?,
        offline_grace_period: Duration::from_millis(grace_ms.max(0) as u64),
        revoked_at: row.get(10)?,
    })
}

fn row_to_cek(row: &Row<'_>) -> rusqlite::Result<ContentEncryptionKey> {
    Ok(ContentEncryptionKey {
        id: get_id(row, 0)?,
        user_id: get_id(row, 1)?,
        material_id: get_id(row, 2)?,
        device_id: get_id(row, 3)?,
        wrapped_key: row.get(4)?,
        key_version: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn get_opt_id<T: From<Uuid>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        Uuid::parse_str(&raw)
            .map(T::from)
            .map_err(|e| conversion(idx, e))
    })
    .transpose()
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let action: String = row.get(3)?;
    Ok(AuditRecord {
        id: get_id(row, 0)?,
        user_id: get_opt_id(row, 1)?,
        device_id: get_opt_id(row, 2)?,
        action: action.parse().map_err(|e| conversion(3, e))?,
        resource_id: get_id(row, 4)?,
        success: row.get(5)?,
        error_code: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<EncryptionJob> {
    let status: String = row.get(6)?;
    Ok(EncryptionJob {
        id: get_id(row, 0)?,
        material_id: get_id(row, 1)?,
        user_id: get_id(row, 2)?,
        device_id: get_id(row, 3)?,
        license_id: get_id(row, 4)?,
        priority: JobPriority::from_raw(row.get(5)?),
        status: status.parse().map_err(|e| conversion(6, e))?,
        retry_count: row.get(7)?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        error_message: row.get(11)?,
    })
}

fn query_one<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Option<T>> {
    conn.query_row(sql, params, map)
        .optional()
        .map_err(StoreError::from)
}

fn query_all<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, map)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Revoke every active license matching `filter` (a WHERE fragment using
/// positional parameters bound from `args`).
fn revoke_matching(
    conn: &mut Connection,
    filter: &str,
    args: Vec<String>,
    at: i64,
) -> Result<Vec<LicenseId>> {
    let tx = conn.transaction()?;
    let ids = {
        let mut stmt = tx.prepare(&format!(
            "SELECT id FROM licenses WHERE status = 'active' AND {filter}"
        ))?;
        let ids = stmt
            .query_map(params_from_iter(args.iter()), |row| get_id::<LicenseId>(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids
    };

    for id in &ids {
        tx.execute(
            "UPDATE licenses SET status = 'revoked', revoked_at = ?2 WHERE id = ?1",
            params![id.to_string(), at],
        )?;
    }
    tx.commit()?;
    Ok(ids)
}

/// Insert or supersede a content key, refusing revoked devices. Callers
/// needing atomicity with other checks pass a transaction.
fn upsert_cek_row(conn: &Connection, cek: &ContentEncryptionKey) -> Result<ContentEncryptionKey> {
    let (user, material, device) = (
        cek.user_id.to_string(),
        cek.material_id.to_string(),
        cek.device_id.to_string(),
    );

    let revoked_at: Option<Option<i64>> = conn
        .query_row(
            "SELECT revoked_at FROM devices WHERE id = ?1",
            params![device],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(Some(_)) = revoked_at {
        return Err(StoreError::DeviceRevoked(cek.device_id));
    }

    conn.execute(
        "INSERT INTO content_keys (
            id, user_id, material_id, device_id, wrapped_key, key_version, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(user_id, material_id, device_id) DO UPDATE SET
            wrapped_key = excluded.wrapped_key,
            key_version = content_keys.key_version + 1,
            created_at = excluded.created_at",
        params![
            cek.id.to_string(),
            user,
            material,
            device,
            cek.wrapped_key,
            cek.key_version,
            cek.created_at,
        ],
    )?;

    query_one(
        conn,
        &format!(
            "SELECT {CEK_COLUMNS} FROM content_keys
             WHERE user_id = ?1 AND material_id = ?2 AND device_id = ?3"
        ),
        params![user, material, device],
        row_to_cek,
    )?
    .ok_or_else(|| StoreError::InvalidData(format!("content key {} vanished", cek.id)))
}

/// One page of audit records matching `column = value`, newest first.
fn audit_page(
    conn: &Connection,
    column: &str,
    value: String,
    limit: usize,
    offset: usize,
) -> Result<(Vec<AuditRecord>, u64)> {
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM audit_log WHERE {column} = ?1"),
        params![value],
        |row| row.get(0),
    )?;
    let records = query_all(
        conn,
        &format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE {column} = ?1
             ORDER BY created_at DESC, seq DESC LIMIT ?2 OFFSET ?3"
        ),
        params![value, limit as i64, offset as i64],
        row_to_audit,
    )?;
    Ok((records, total as u64))
}

#[async_trait]
impl DeviceRepository for SqliteStore {
    async fn register_device(&self, device: &Device, max_active: usize) -> Result<DeviceInsert> {
        let device = device.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let user = device.user_id.to_string();

            let existing: Option<DeviceId> = tx
                .query_row(
                    "SELECT id FROM devices
                     WHERE user_id = ?1 AND fingerprint = ?2 AND revoked_at IS NULL",
                    params![user, device.fingerprint.as_str()],
                    |row| get_id(row, 0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Ok(DeviceInsert::Duplicate { existing });
            }

            let active: i64 = tx.query_row(
                "SELECT COUNT(*) FROM devices WHERE user_id = ?1 AND revoked_at IS NULL",
                params![user],
                |row| row.get(0),
            )?;
            let active = active as usize;
            if active >= max_active {
                return Ok(DeviceInsert::LimitReached { active });
            }

            tx.execute(
                "INSERT INTO devices (
                    id, user_id, fingerprint, name, platform,
                    registered_at, last_used_at, revoked_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    device.id.to_string(),
                    user,
                    device.fingerprint.as_str(),
                    device.name,
                    device.platform.as_str(),
                    device.registered_at,
                    device.last_used_at,
                    device.revoked_at,
                ],
            )?;
            tx.commit()?;

            Ok(DeviceInsert::Inserted)
        })
        .await
    }

    async fn get_device(&self, id: &DeviceId) -> Result<Option<Device>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            query_one(
                conn,
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
                params![id],
                row_to_device,
            )
        })
        .await
    }

    async fn find_active_by_fingerprint(
        &self,
        user_id: &UserId,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Device>> {
        let user = user_id.to_string();
        let fingerprint = fingerprint.as_str().to_string();
        self.blocking(move |conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices
                     WHERE user_id = ?1 AND fingerprint = ?2 AND revoked_at IS NULL"
                ),
                params![user, fingerprint],
                row_to_device,
            )
        })
        .await
    }

    async fn list_active_devices(&self, user_id: &UserId) -> Result<Vec<Device>> {
        let user = user_id.to_string();
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices
                     WHERE user_id = ?1 AND revoked_at IS NULL
                     ORDER BY registered_at"
                ),
                params![user],
                row_to_device,
            )
        })
        .await
    }

    async fn count_active_devices(&self, user_id: &UserId) -> Result<usize> {
        let user = user_id.to_string();
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM devices WHERE user_id = ?1 AND revoked_at IS NULL",
                params![user],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn touch_device(&self, id: &DeviceId, at: i64) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE devices SET last_used_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
                params![id, at],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn revoke_device(&self, id: &DeviceId, at: i64) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE devices SET revoked_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
                params![id, at],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[async_trait]
impl LicenseRepository for SqliteStore {
    async fn insert_license(&self, license: &License) -> Result<LicenseInsert> {
        let license = license.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let user = license.user_id.to_string();
            let material = license.material_id.to_string();
            let device = license.device_id.to_string();

            let existing = query_one(
                &tx,
                &format!(
                    "SELECT {LICENSE_COLUMNS} FROM licenses
                     WHERE user_id = ?1 AND material_id = ?2 AND device_id = ?3
                       AND status = 'active'"
                ),
                params![user, material, device],
                row_to_license,
            )?;
            if let Some(existing) = existing {
                return Ok(LicenseInsert::ActiveExists { existing });
            }

            tx.execute(
                "INSERT INTO licenses (
                    id, user_id, material_id, device_id, status, nonce, issued_at,
                    last_validated_at, expires_at, grace_period_ms, revoked_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    license.id.to_string(),
                    user,
                    material,
                    device,
                    license.status.as_str(),
                    license.nonce.as_str(),
                    license.issued_at,
                    license.last_validated_at,
                    license.expires_at,
                    custodian_core::time::duration_millis(license.offline_grace_period),
                    license.revoked_at,
                ],
            )?;
            tx.commit()?;

            Ok(LicenseInsert::Inserted)
        })
        .await
    }

    async fn get_license(&self, id: &LicenseId) -> Result<Option<License>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            query_one(
                conn,
                &format!("SELECT {LICENSE_COLUMNS} FROM licenses WHERE id = ?1"),
                params![id],
                row_to_license,
            )
        })
        .await
    }

    async fn find_active_license(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        device_id: &DeviceId,
    ) -> Result<Option<License>> {
        let (user, material, device) = (
            user_id.to_string(),
            material_id.to_string(),
            device_id.to_string(),
        );
        self.blocking(move |conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {LICENSE_COLUMNS} FROM licenses
                     WHERE user_id = ?1 AND material_id = ?2 AND device_id = ?3
                       AND status = 'active'"
                ),
                params![user, material, device],
                row_to_license,
            )
        })
        .await
    }

    async fn list_active_by_device(&self, device_id: &DeviceId) -> Result<Vec<License>> {
        let device = device_id.to_string();
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {LICENSE_COLUMNS} FROM licenses
                     WHERE device_id = ?1 AND status = 'active'
                     ORDER BY issued_at"
                ),
                params![device],
                row_to_license,
            )
        })
        .await
    }

    async fn list_active_by_user(&self, user_id: &UserId) -> Result<Vec<License>> {
        let user = user_id.to_string();
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {LICENSE_COLUMNS} FROM licenses
                     WHERE user_id = ?1 AND status = 'active'
                     ORDER BY issued_at"
                ),
                params![user],
                row_to_license,
            )
        })
        .await
    }

    async fn rotate_nonce(
        &self,
        id: &LicenseId,
        expected: &Nonce,
        new: &Nonce,
        at: i64,
    ) -> Result<Option<License>> {
        let id = id.to_string();
        let expected = expected.as_str().to_string();
        let new = new.as_str().to_string();

        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE licenses SET nonce = ?3, last_validated_at = ?4
                 WHERE id = ?1 AND nonce = ?2 AND status = 'active'",
                params![id, expected, new, at],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_one(
                conn,
                &format!("SELECT {LICENSE_COLUMNS} FROM licenses WHERE id = ?1"),
                params![id],
                row_to_license,
            )
        })
        .await
    }

    async fn extend_expiry(&self, id: &LicenseId, expires_at: i64) -> Result<Option<License>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE licenses SET expires_at = ?2 WHERE id = ?1 AND status = 'active'",
                params![id, expires_at],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_one(
                conn,
                &format!("SELECT {LICENSE_COLUMNS} FROM licenses WHERE id = ?1"),
                params![id],
                row_to_license,
            )
        })
        .await
    }

    async fn revoke_license(&self, id: &LicenseId, at: i64) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE licenses SET status = 'revoked', revoked_at = ?2
                 WHERE id = ?1 AND status = 'active'",
                params![id, at],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn revoke_by_device(&self, device_id: &DeviceId, at: i64) -> Result<Vec<LicenseId>> {
        let args = vec![device_id.to_string()];
        self.blocking(move |conn| revoke_matching(conn, "device_id = ?1", args, at))
            .await
    }

    async fn revoke_by_material(
        &self,
        material_id: &MaterialId,
        at: i64,
    ) -> Result<Vec<LicenseId>> {
        let args = vec![material_id.to_string()];
        self.blocking(move |conn| revoke_matching(conn, "material_id = ?1", args, at))
            .await
    }

    async fn revoke_by_user_material(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        at: i64,
    ) -> Result<Vec<LicenseId>> {
        let args = vec![user_id.to_string(), material_id.to_string()];
        self.blocking(move |conn| {
            revoke_matching(conn, "user_id = ?1 AND material_id = ?2", args, at)
        })
        .await
    }
}

#[async_trait]
impl CekRepository for SqliteStore {
    async fn upsert_cek(&self, cek: &ContentEncryptionKey) -> Result<ContentEncryptionKey> {
        let cek = cek.clone();
        self.blocking(move |conn| upsert_cek_row(conn, &cek)).await
    }

    async fn upsert_licensed_cek(
        &self,
        cek: &ContentEncryptionKey,
        license_id: &LicenseId,
    ) -> Result<Option<ContentEncryptionKey>> {
        let cek = cek.clone();
        let license = license_id.to_string();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            let bound: i64 = tx.query_row(
                "SELECT COUNT(*) FROM licenses l
                 JOIN devices d ON d.id = l.device_id
                 WHERE l.id = ?1 AND l.status = 'active'
                   AND l.user_id = ?2 AND l.material_id = ?3 AND l.device_id = ?4
                   AND d.revoked_at IS NULL",
                params![
                    license,
                    cek.user_id.to_string(),
                    cek.material_id.to_string(),
                    cek.device_id.to_string(),
                ],
                |row| row.get(0),
            )?;
            if bound == 0 {
                return Ok(None);
            }

            let stored = upsert_cek_row(&tx, &cek)?;
            tx.commit()?;
            Ok(Some(stored))
        })
        .await
    }

    async fn list_ceks_by_version(&self, key_version: u32) -> Result<Vec<ContentEncryptionKey>> {
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {CEK_COLUMNS} FROM content_keys
                     WHERE key_version = ?1 ORDER BY created_at"
                ),
                params![key_version],
                row_to_cek,
            )
        })
        .await
    }

    async fn rewrap_cek(
        &self,
        id: &CekId,
        expected_version: u32,
        wrapped_key: &[u8],
        new_version: u32,
    ) -> Result<bool> {
        let id = id.to_string();
        let wrapped = wrapped_key.to_vec();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE content_keys SET wrapped_key = ?3, key_version = ?4
                 WHERE id = ?1 AND key_version = ?2",
                params![id, expected_version, wrapped, new_version],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn get_cek(&self, id: &CekId) -> Result<Option<ContentEncryptionKey>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            query_one(
                conn,
                &format!("SELECT {CEK_COLUMNS} FROM content_keys WHERE id = ?1"),
                params![id],
                row_to_cek,
            )
        })
        .await
    }

    async fn find_cek(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        device_id: &DeviceId,
    ) -> Result<Option<ContentEncryptionKey>> {
        let (user, material, device) = (
            user_id.to_string(),
            material_id.to_string(),
            device_id.to_string(),
        );
        self.blocking(move |conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {CEK_COLUMNS} FROM content_keys
                     WHERE user_id = ?1 AND material_id = ?2 AND device_id = ?3"
                ),
                params![user, material, device],
                row_to_cek,
            )
        })
        .await
    }

    async fn delete_by_device(&self, device_id: &DeviceId) -> Result<u64> {
        let device = device_id.to_string();
        self.blocking(move |conn| {
            let removed =
                conn.execute("DELETE FROM content_keys WHERE device_id = ?1", params![device])?;
            Ok(removed as u64)
        })
        .await
    }

    async fn delete_by_material(&self, material_id: &MaterialId) -> Result<u64> {
        let material = material_id.to_string();
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM content_keys WHERE material_id = ?1",
                params![material],
            )?;
            Ok(removed as u64)
        })
        .await
    }
}

#[async_trait]
impl JobRepository for SqliteStore {
    async fn insert_job(&self, job: &EncryptionJob) -> Result<()> {
        let job = job.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO encryption_jobs (
                    id, material_id, user_id, device_id, license_id, priority, status,
                    retry_count, created_at, started_at, completed_at, error_message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    job.id.to_string(),
                    job.material_id.to_string(),
                    job.user_id.to_string(),
                    job.device_id.to_string(),
                    job.license_id.to_string(),
                    job.priority.as_raw(),
                    job.status.as_str(),
                    job.retry_count,
                    job.created_at,
                    job.started_at,
                    job.completed_at,
                    job.error_message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<EncryptionJob>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            query_one(
                conn,
                &format!("SELECT {JOB_COLUMNS} FROM encryption_jobs WHERE id = ?1"),
                params![id],
                row_to_job,
            )
        })
        .await
    }

    async fn latest_job_for_material(
        &self,
        material_id: &MaterialId,
    ) -> Result<Option<EncryptionJob>> {
        let material = material_id.to_string();
        self.blocking(move |conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM encryption_jobs
                     WHERE material_id = ?1 ORDER BY created_at DESC LIMIT 1"
                ),
                params![material],
                row_to_job,
            )
        })
        .await
    }

    async fn latest_job_for_license(
        &self,
        license_id: &LicenseId,
    ) -> Result<Option<EncryptionJob>> {
        let license = license_id.to_string();
        self.blocking(move |conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM encryption_jobs
                     WHERE license_id = ?1 ORDER BY created_at DESC LIMIT 1"
                ),
                params![license],
                row_to_job,
            )
        })
        .await
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<EncryptionJob>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM encryption_jobs
                     WHERE status = 'pending'
                     ORDER BY priority ASC, created_at ASC
                     LIMIT ?1"
                ),
                params![limit],
                row_to_job,
            )
        })
        .await
    }

    async fn job_counts(&self) -> Result<JobCounts> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM encryption_jobs GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut counts = JobCounts::default();
            for (status, count) in rows {
                let count = count as u64;
                match status.as_str() {
                    "pending" => counts.pending = count,
                    "processing" => counts.processing = count,
                    "completed" => counts.completed = count,
                    "failed" => counts.failed = count,
                    other => {
                        return Err(StoreError::InvalidData(format!(
                            "unknown job status: {other}"
                        )))
                    }
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn claim_job(&self, id: &JobId, at: i64) -> Result<Option<EncryptionJob>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE encryption_jobs SET status = 'processing', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, at],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_one(
                conn,
                &format!("SELECT {JOB_COLUMNS} FROM encryption_jobs WHERE id = ?1"),
                params![id],
                row_to_job,
            )
        })
        .await
    }

    async fn complete_job(&self, id: &JobId, at: i64) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE encryption_jobs
                 SET status = 'completed', completed_at = ?2, error_message = NULL
                 WHERE id = ?1 AND status = 'processing'",
                params![id, at],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn fail_job(&self, id: &JobId, error: &str, at: i64) -> Result<bool> {
        let id = id.to_string();
        let error = error.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE encryption_jobs
                 SET status = 'failed', completed_at = ?3, error_message = ?2
                 WHERE id = ?1 AND status = 'processing'",
                params![id, error, at],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn retry_job(&self, id: &JobId, error: &str, max_retries: u32) -> Result<Option<u32>> {
        let id = id.to_string();
        let error = error.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE encryption_jobs
                 SET retry_count = retry_count + 1, error_message = ?2
                 WHERE id = ?1 AND status = 'processing' AND retry_count < ?3",
                params![id, error, max_retries],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let count: u32 = conn.query_row(
                "SELECT retry_count FROM encryption_jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(Some(count))
        })
        .await
    }

    async fn release_job(&self, id: &JobId) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE encryption_jobs SET status = 'pending'
                 WHERE id = ?1 AND status = 'processing'",
                params![id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn delete_completed_before(&self, cutoff: i64) -> Result<u64> {
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM encryption_jobs WHERE status = 'completed' AND completed_at < ?1",
                params![cutoff],
            )?;
            Ok(removed as u64)
        })
        .await
    }
}

#[async_trait]
impl AuditRepository for SqliteStore {
    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let record = record.clone();
        self.blocking(move |conn| {
            conn.execute(
                &format!("INSERT INTO audit_log ({AUDIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    record.id.to_string(),
                    record.user_id.map(|id| id.to_string()),
                    record.device_id.map(|id| id.to_string()),
                    record.action.as_str(),
                    record.resource_id.to_string(),
                    record.success,
                    record.error_code,
                    record.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn audit_for_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<AuditRecord>, u64)> {
        let user = user_id.to_string();
        self.blocking(move |conn| audit_page(conn, "user_id", user, limit, offset))
            .await
    }

    async fn audit_for_device(
        &self,
        device_id: &DeviceId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<AuditRecord>, u64)> {
        let device = device_id.to_string();
        self.blocking(move |conn| audit_page(conn, "device_id", device, limit, offset))
            .await
    }
}

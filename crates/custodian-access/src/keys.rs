//! Content-key store.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use custodian_core::{
    AuditAction, AuditRecord, CekId, ContentEncryptionKey, CoreError, DeviceId, EventKind,
    LicenseId, MaterialId, UserId,
};
use custodian_store::{CekRepository, StoreError};

use crate::audit::AuditTrail;
use crate::error::{AccessError, Result};
use crate::notify::Notifier;
use crate::ports::KeyRewrap;

/// Outcome of a key rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub rotated: usize,
    pub failed: usize,
    /// Keys superseded or deleted while the rotation ran.
    pub skipped: usize,
}

/// Owns per-device wrapped content keys.
///
/// Deleting a device's keys is the hard revocation boundary: ciphertext already
/// on the device can no longer be opened.
#[derive(Clone)]
pub struct CekStore {
    repo: Arc<dyn CekRepository>,
    notifier: Notifier,
    audit: AuditTrail,
}

fn revoked_device(e: StoreError) -> AccessError {
    match e {
        StoreError::DeviceRevoked(_) => AccessError::DeviceRevoked,
        e => e.into(),
    }
}

impl CekStore {
    pub fn new(repo: Arc<dyn CekRepository>, notifier: Notifier) -> Self {
        Self {
            repo,
            notifier,
            audit: AuditTrail::disabled(),
        }
    }

    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = audit;
        self
    }

    /// Store the wrapped key produced for a device, superseding any previous
    /// version. Fails with `DeviceRevoked` if the device has been revoked.
    pub async fn store_key(
        &self,
        user_id: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        wrapped_key: Vec<u8>,
        now: i64,
    ) -> Result<ContentEncryptionKey> {
        let cek = ContentEncryptionKey::new(user_id, material_id, device_id, wrapped_key, now);
        let stored = self.repo.upsert_cek(&cek).await.map_err(revoked_device)?;
        self.announce_stored(&stored, now).await;
        Ok(stored)
    }

    /// Store a wrapped key on behalf of `license_id`.
    ///
    /// Returns `None` without writing if the license is no longer active and
    /// bound to (user, material, device), or the device has been revoked.
    pub async fn store_licensed_key(
        &self,
        license_id: &LicenseId,
        user_id: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        wrapped_key: Vec<u8>,
        now: i64,
    ) -> Result<Option<ContentEncryptionKey>> {
        let cek = ContentEncryptionKey::new(user_id, material_id, device_id, wrapped_key, now);
        match self.repo.upsert_licensed_cek(&cek, license_id).await? {
            Some(stored) => {
                self.announce_stored(&stored, now).await;
                Ok(Some(stored))
            }
            None => {
                tracing::info!(
                    license_id = %license_id,
                    device_id = %device_id,
                    "content key discarded, binding no longer active"
                );
                self.audit
                    .record(
                        AuditRecord::failure(AuditAction::KeyGenerate, cek.id, "binding_revoked", now)
                            .by_user(user_id)
                            .on_device(device_id),
                    )
                    .await;
                Ok(None)
            }
        }
    }

    async fn announce_stored(&self, stored: &ContentEncryptionKey, now: i64) {
        tracing::info!(
            cek_id = %stored.id,
            material_id = %stored.material_id,
            device_id = %stored.device_id,
            key_version = stored.key_version,
            "content key stored"
        );
        self.audit
            .record(
                AuditRecord::success(AuditAction::KeyGenerate, stored.id, now)
                    .by_user(stored.user_id)
                    .on_device(stored.device_id),
            )
            .await;
        self.notifier.publish(
            EventKind::KeyGenerated,
            json!({
                "cek_id": stored.id,
                "user_id": stored.user_id,
                "material_id": stored.material_id,
                "device_id": stored.device_id,
                "key_version": stored.key_version,
            }),
            now,
        );
    }

    /// Re-wrap every key at `from_version` and move it to `to_version`.
    ///
    /// A key that fails to re-wrap is logged and left at its old version; the
    /// rotation carries on with the rest.
    pub async fn rotate(
        &self,
        from_version: u32,
        to_version: u32,
        rewrap: &dyn KeyRewrap,
        now: i64,
    ) -> Result<RotationReport> {
        if to_version <= from_version {
            return Err(CoreError::InvalidKeyVersion {
                from: from_version,
                to: to_version,
            }
            .into());
        }

        let keys = self.repo.list_ceks_by_version(from_version).await?;
        let mut report = RotationReport::default();

        for cek in &keys {
            let wrapped = match rewrap.rewrap(cek, to_version).await {
                Ok(wrapped) => wrapped,
                Err(e) => {
                    tracing::warn!(cek_id = %cek.id, error = %e, "key rewrap failed");
                    self.audit_rotation(cek, Some("rewrap_failed"), now).await;
                    report.failed += 1;
                    continue;
                }
            };
            match self
                .repo
                .rewrap_cek(&cek.id, from_version, &wrapped, to_version)
                .await
            {
                Ok(true) => {
                    self.audit_rotation(cek, None, now).await;
                    report.rotated += 1;
                }
                Ok(false) => {
                    tracing::debug!(cek_id = %cek.id, "key changed during rotation, skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(cek_id = %cek.id, error = %e, "failed to store rotated key");
                    self.audit_rotation(cek, Some("store_error"), now).await;
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            from_version,
            to_version,
            rotated = report.rotated,
            failed = report.failed,
            skipped = report.skipped,
            "key rotation finished"
        );
        self.notifier.increment("keys.rotation");
        Ok(report)
    }

    async fn audit_rotation(&self, cek: &ContentEncryptionKey, error: Option<&str>, now: i64) {
        let record = match error {
            None => AuditRecord::success(AuditAction::KeyRotate, cek.id, now),
            Some(code) => AuditRecord::failure(AuditAction::KeyRotate, cek.id, code, now),
        };
        self.audit
            .record(record.by_user(cek.user_id).on_device(cek.device_id))
            .await;
    }

    pub async fn get(&self, id: &CekId) -> Result<Option<ContentEncryptionKey>> {
        Ok(self.repo.get_cek(id).await?)
    }

    pub async fn find(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        device_id: &DeviceId,
    ) -> Result<Option<ContentEncryptionKey>> {
        Ok(self.repo.find_cek(user_id, material_id, device_id).await?)
    }

    pub async fn delete_for_device(&self, device_id: &DeviceId) -> Result<u64> {
        let removed = self.repo.delete_by_device(device_id).await?;
        tracing::info!(device_id = %device_id, removed, "content keys deleted for device");
        Ok(removed)
    }

    pub async fn delete_for_material(&self, material_id: &MaterialId) -> Result<u64> {
        let removed = self.repo.delete_by_material(material_id).await?;
        tracing::info!(material_id = %material_id, removed, "content keys deleted for material");
        Ok(removed)
    }
}

//! License manager: issue, validate, renew and revoke offline licenses.
//!
//! Every operation takes `now` explicitly. Validation is the anti-replay core:
//! the nonce is swapped atomically in the repository, so a nonce can be
//! consumed at most once even under concurrent validation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use custodian_core::time::add_duration;
use custodian_core::{
    AuditAction, AuditRecord, Device, DeviceId, EventKind, Fingerprint, JobPriority, License,
    LicenseId, MaterialId, Nonce, UserId,
};
use custodian_store::{DeviceRepository, LicenseInsert, LicenseRepository};

use crate::audit::AuditTrail;
use crate::error::{AccessError, Result};
use crate::guard::AbuseGuard;
use crate::notify::Notifier;
use crate::ports::{AccessChecker, EncryptionRequester};

/// License lifetimes.
#[derive(Debug, Clone)]
pub struct LicenseConfig {
    /// Validity of a freshly issued or renewed license.
    pub license_duration: Duration,
    /// How long a device may stay offline between validations.
    pub offline_grace_period: Duration,
    /// Priority for the encryption job requested on issue.
    pub job_priority: JobPriority,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            license_duration: Duration::from_secs(30 * 24 * 3600),
            offline_grace_period: Duration::from_secs(72 * 3600),
            job_priority: JobPriority::Normal,
        }
    }
}

pub struct LicenseManager {
    licenses: Arc<dyn LicenseRepository>,
    devices: Arc<dyn DeviceRepository>,
    access: Arc<dyn AccessChecker>,
    guard: Option<Arc<AbuseGuard>>,
    requester: Option<Arc<dyn EncryptionRequester>>,
    config: LicenseConfig,
    notifier: Notifier,
    audit: AuditTrail,
}

impl LicenseManager {
    pub fn new(
        licenses: Arc<dyn LicenseRepository>,
        devices: Arc<dyn DeviceRepository>,
        access: Arc<dyn AccessChecker>,
        config: LicenseConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            licenses,
            devices,
            access,
            guard: None,
            requester: None,
            config,
            notifier,
            audit: AuditTrail::disabled(),
        }
    }

    /// Route validation failures through an abuse guard.
    pub fn with_guard(mut self, guard: Arc<AbuseGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Request an encryption job whenever a license is issued.
    pub fn with_requester(mut self, requester: Arc<dyn EncryptionRequester>) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Record issue, validation, renewal and revocation in an audit trail.
    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &LicenseConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Issue
    // ─────────────────────────────────────────────────────────────────────────

    /// Issue a license for (user, material, device).
    ///
    /// Returns the existing license if an active, unexpired one is already
    /// bound to the triple.
    pub async fn issue(
        &self,
        user_id: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        fingerprint: &Fingerprint,
        now: i64,
    ) -> Result<License> {
        let result = self
            .issue_inner(user_id, material_id, device_id, fingerprint, now)
            .await;
        let record = match &result {
            Ok((_, true)) => None,
            Ok((license, false)) => Some(AuditRecord::success(
                AuditAction::LicenseIssue,
                license.id,
                now,
            )),
            Err(AccessError::Store(_)) => None,
            // No license exists yet, so the refusal is filed against the material.
            Err(e) => Some(AuditRecord::failure(
                AuditAction::LicenseIssue,
                material_id,
                e.code(),
                now,
            )),
        };
        if let Some(record) = record {
            self.audit
                .record(record.by_user(user_id).on_device(device_id))
                .await;
        }
        result.map(|(license, _)| license)
    }

    async fn issue_inner(
        &self,
        user_id: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        fingerprint: &Fingerprint,
        now: i64,
    ) -> Result<(License, bool)> {
        let device = self
            .devices
            .get_device(&device_id)
            .await?
            .filter(|d| d.user_id == user_id)
            .ok_or(AccessError::DeviceNotRegistered)?;
        if device.is_revoked() {
            return Err(AccessError::DeviceRevoked);
        }
        if device.fingerprint != *fingerprint {
            return Err(AccessError::DeviceMismatch);
        }

        match self.access.check_access(&user_id, &material_id).await {
            Ok(true) => {}
            Ok(false) => return Err(AccessError::AccessDenied),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    material_id = %material_id,
                    error = %e,
                    "access check failed, denying"
                );
                return Err(AccessError::AccessDenied);
            }
        }

        let (license, reused) = self.active_or_new(user_id, material_id, device_id, now).await?;

        if let Some(requester) = &self.requester {
            if let Err(e) = requester
                .request_encryption(&license, self.config.job_priority, now)
                .await
            {
                tracing::warn!(
                    license_id = %license.id,
                    error = %e,
                    "failed to request encryption job"
                );
            }
        }

        self.touch(&device_id, now).await;

        if reused {
            tracing::debug!(license_id = %license.id, "returning existing active license");
        } else {
            tracing::info!(
                license_id = %license.id,
                user_id = %user_id,
                material_id = %material_id,
                device_id = %device_id,
                expires_at = license.expires_at,
                "license issued"
            );
            self.notifier.increment("license.issued");
        }
        self.notifier.publish(
            EventKind::LicenseIssued,
            json!({
                "license_id": license.id,
                "user_id": user_id,
                "material_id": material_id,
                "device_id": device_id,
                "expires_at": license.expires_at,
                "reused": reused,
            }),
            now,
        );

        Ok((license, reused))
    }

    async fn active_or_new(
        &self,
        user_id: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        now: i64,
    ) -> Result<(License, bool)> {
        if let Some(existing) = self
            .licenses
            .find_active_license(&user_id, &material_id, &device_id)
            .await?
        {
            if !existing.is_expired(now) {
                return Ok((existing, true));
            }
            // Expired but still active: retire it so the triple is free.
            self.licenses.revoke_license(&existing.id, now).await?;
        }

        let license = License::issue(
            user_id,
            material_id,
            device_id,
            self.config.license_duration,
            self.config.offline_grace_period,
            now,
        );
        match self.licenses.insert_license(&license).await? {
            LicenseInsert::Inserted => Ok((license, false)),
            LicenseInsert::ActiveExists { existing } => Ok((existing, true)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validate / Renew
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate a license and rotate its nonce.
    ///
    /// The returned license carries the nonce the client must present next.
    pub async fn validate(
        &self,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
        nonce: &Nonce,
        now: i64,
    ) -> Result<License> {
        let started = Instant::now();
        let result = self
            .validate_inner(license_id, device_id, fingerprint, nonce, now)
            .await;
        self.notifier.observe("license.validate", started.elapsed());

        match &result {
            Ok(license) => {
                self.audit
                    .record(
                        AuditRecord::success(AuditAction::LicenseValidate, *license_id, now)
                            .by_user(license.user_id)
                            .on_device(*device_id),
                    )
                    .await;
                self.notifier.increment("license.validate.success");
                self.notifier.publish(
                    EventKind::LicenseValidated,
                    json!({
                        "license_id": license.id,
                        "device_id": device_id,
                        "validated_at": now,
                    }),
                    now,
                );
            }
            Err(e) => {
                self.audit
                    .record(
                        AuditRecord::failure(AuditAction::LicenseValidate, *license_id, e.code(), now)
                            .on_device(*device_id),
                    )
                    .await;
                self.notifier.increment("license.validate.failure");
                tracing::debug!(license_id = %license_id, device_id = %device_id, error = %e, "validation rejected");
            }
        }
        result
    }

    async fn validate_inner(
        &self,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
        nonce: &Nonce,
        now: i64,
    ) -> Result<License> {
        if let Some(guard) = &self.guard {
            guard.check_not_blocked(device_id, now)?;
        }

        let license = self
            .check_binding(license_id, device_id, fingerprint, now)
            .await?;

        if let Err(violation) = license.check_with_nonce(device_id, nonce, now) {
            self.record_failure(device_id, now).await;
            return Err(violation.into());
        }

        let next = Nonce::generate();
        let Some(updated) = self
            .licenses
            .rotate_nonce(license_id, nonce, &next, now)
            .await?
        else {
            // Lost the swap: either a concurrent validation consumed the nonce
            // or the license was revoked in between.
            self.record_failure(device_id, now).await;
            let current = self.licenses.get_license(license_id).await?;
            return Err(match current {
                Some(l) if l.is_revoked() => AccessError::LicenseRevoked,
                Some(_) => AccessError::InvalidNonce,
                None => AccessError::LicenseNotFound,
            });
        };

        self.touch(device_id, now).await;
        Ok(updated)
    }

    /// Check that a license exists, is active, is bound to this device and
    /// fingerprint, and is inside both its expiry and offline window.
    ///
    /// Does not look at or rotate the nonce. Failures are recorded against the
    /// device in the abuse guard.
    pub async fn check_binding(
        &self,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
        now: i64,
    ) -> Result<License> {
        let result = self
            .check_binding_inner(license_id, device_id, fingerprint, now)
            .await;
        if let Err(e) = &result {
            if !matches!(e, AccessError::Store(_)) {
                self.record_failure(device_id, now).await;
            }
        }
        result
    }

    async fn check_binding_inner(
        &self,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
        now: i64,
    ) -> Result<License> {
        let license = self
            .licenses
            .get_license(license_id)
            .await?
            .ok_or(AccessError::LicenseNotFound)?;

        if license.is_revoked() {
            return Err(AccessError::LicenseRevoked);
        }
        if license.device_id != *device_id {
            return Err(AccessError::DeviceMismatch);
        }
        let device = self.devices.get_device(device_id).await?;
        if !bound_device_matches(device.as_ref(), fingerprint) {
            return Err(AccessError::DeviceMismatch);
        }

        license.check(device_id, now)?;
        Ok(license)
    }

    /// Extend a license's expiry. Neither the nonce nor any content key changes.
    pub async fn renew(
        &self,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
        now: i64,
    ) -> Result<License> {
        let result = self.renew_inner(license_id, device_id, fingerprint, now).await;
        let record = match &result {
            Ok(license) => Some(
                AuditRecord::success(AuditAction::LicenseRenew, *license_id, now)
                    .by_user(license.user_id),
            ),
            Err(AccessError::Store(_)) => None,
            Err(e) => Some(AuditRecord::failure(
                AuditAction::LicenseRenew,
                *license_id,
                e.code(),
                now,
            )),
        };
        if let Some(record) = record {
            self.audit.record(record.on_device(*device_id)).await;
        }
        result
    }

    async fn renew_inner(
        &self,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
        now: i64,
    ) -> Result<License> {
        let license = self
            .licenses
            .get_license(license_id)
            .await?
            .ok_or(AccessError::LicenseNotFound)?;
        if license.is_revoked() {
            return Err(AccessError::LicenseRevoked);
        }
        if license.device_id != *device_id {
            return Err(AccessError::DeviceMismatch);
        }
        let device = self.devices.get_device(device_id).await?;
        if !bound_device_matches(device.as_ref(), fingerprint) {
            return Err(AccessError::DeviceMismatch);
        }

        let expires_at = add_duration(now, self.config.license_duration);
        let renewed = self
            .licenses
            .extend_expiry(license_id, expires_at)
            .await?
            .ok_or(AccessError::LicenseRevoked)?;

        tracing::info!(license_id = %license_id, expires_at, "license renewed");
        self.notifier.increment("license.renewed");
        self.notifier.publish(
            EventKind::LicenseRenewed,
            json!({
                "license_id": license_id,
                "device_id": device_id,
                "expires_at": expires_at,
            }),
            now,
        );
        Ok(renewed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Revoke
    // ─────────────────────────────────────────────────────────────────────────

    /// Revoke a single license. Revoking an already-revoked license is a no-op.
    pub async fn revoke(&self, license_id: &LicenseId, now: i64) -> Result<()> {
        if self.licenses.get_license(license_id).await?.is_none() {
            return Err(AccessError::LicenseNotFound);
        }
        if self.licenses.revoke_license(license_id, now).await? {
            self.announce_revoked(&[*license_id], "license", now).await;
        }
        Ok(())
    }

    /// Revoke every active license bound to a device.
    pub async fn revoke_by_device(&self, device_id: &DeviceId, now: i64) -> Result<Vec<LicenseId>> {
        let revoked = self.licenses.revoke_by_device(device_id, now).await?;
        self.announce_revoked(&revoked, "device", now).await;
        Ok(revoked)
    }

    /// Revoke every active license for a material (content takedown).
    pub async fn revoke_by_material(
        &self,
        material_id: &MaterialId,
        now: i64,
    ) -> Result<Vec<LicenseId>> {
        let revoked = self.licenses.revoke_by_material(material_id, now).await?;
        self.announce_revoked(&revoked, "material", now).await;
        Ok(revoked)
    }

    /// Revoke a user's licenses for a material (entitlement withdrawn).
    pub async fn revoke_by_user_material(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        now: i64,
    ) -> Result<Vec<LicenseId>> {
        let revoked = self
            .licenses
            .revoke_by_user_material(user_id, material_id, now)
            .await?;
        self.announce_revoked(&revoked, "entitlement", now).await;
        Ok(revoked)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get(&self, license_id: &LicenseId) -> Result<License> {
        self.licenses
            .get_license(license_id)
            .await?
            .ok_or(AccessError::LicenseNotFound)
    }

    pub async fn list_active(&self, user_id: &UserId) -> Result<Vec<License>> {
        Ok(self.licenses.list_active_by_user(user_id).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn record_failure(&self, device_id: &DeviceId, now: i64) {
        if let Some(guard) = &self.guard {
            if guard.record_validation_failure(device_id, now).await {
                self.notifier.increment("abuse.device_blocked");
            }
        }
    }

    async fn touch(&self, device_id: &DeviceId, now: i64) {
        if let Err(e) = self.devices.touch_device(device_id, now).await {
            tracing::warn!(device_id = %device_id, error = %e, "failed to update device last use");
        }
    }

    async fn announce_revoked(&self, ids: &[LicenseId], reason: &'static str, now: i64) {
        for id in ids {
            self.audit
                .record(AuditRecord::success(AuditAction::LicenseRevoke, *id, now))
                .await;
            tracing::info!(license_id = %id, reason, "license revoked");
            self.notifier.increment("license.revoked");
            self.notifier.publish(
                EventKind::LicenseRevoked,
                json!({ "license_id": id, "reason": reason, "revoked_at": now }),
                now,
            );
        }
    }
}

fn bound_device_matches(device: Option<&Device>, fingerprint: &Fingerprint) -> bool {
    matches!(device, Some(d) if d.is_active() && d.fingerprint == *fingerprint)
}

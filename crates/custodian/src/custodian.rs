//! The Custodian: one handle over devices, licenses, keys and jobs.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use custodian_access::{
    AbuseGuard, AccessChecker, AccessError, AuditTrail, CekStore, DeviceRegistry, DownloadQuota,
    KeyRewrap, LicenseManager, Notifier, RotationReport,
};
use custodian_core::{
    now_millis, AuditAction, AuditRecord, ContentEncryptionKey, Device, DeviceId, EncryptionJob,
    EventKind, Fingerprint, JobId, License, LicenseId, MaterialId, Nonce, Platform, UserId,
};
use custodian_jobs::{EncryptionEngine, JobService, WorkerPool};
use custodian_store::{JobCounts, Store};

use crate::config::CustodianConfig;
use crate::error::{CustodianError, Result};

/// Everything a device needs to open a downloaded material.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadGrant {
    pub license: License,
    pub key: ContentEncryptionKey,
    pub quota: DownloadQuota,
}

/// The main Custodian struct.
///
/// Wires every component over one store and one set of observability ports.
/// All methods read the wall clock once and pass it down.
pub struct Custodian<S: Store> {
    store: Arc<S>,
    devices: DeviceRegistry,
    licenses: Arc<LicenseManager>,
    keys: CekStore,
    guard: Arc<AbuseGuard>,
    jobs: Arc<JobService>,
    workers: WorkerPool,
    config: CustodianConfig,
    notifier: Notifier,
    audit: AuditTrail,
}

impl<S: Store + 'static> Custodian<S> {
    /// Create a Custodian that drops events and metrics.
    pub fn new(
        store: Arc<S>,
        access: Arc<dyn AccessChecker>,
        engine: Arc<dyn EncryptionEngine>,
        config: CustodianConfig,
    ) -> Self {
        Self::with_notifier(store, access, engine, config, Notifier::noop())
    }

    pub fn with_notifier(
        store: Arc<S>,
        access: Arc<dyn AccessChecker>,
        engine: Arc<dyn EncryptionEngine>,
        config: CustodianConfig,
        notifier: Notifier,
    ) -> Self {
        let retry = config.retry_policy();
        let audit = AuditTrail::new(store.clone());
        let guard = Arc::new(AbuseGuard::new(config.abuse_config()).with_audit(audit.clone()));
        let keys = CekStore::new(store.clone(), notifier.clone()).with_audit(audit.clone());
        let jobs = Arc::new(JobService::new(store.clone(), retry, notifier.clone()));

        let licenses = Arc::new(
            LicenseManager::new(
                store.clone(),
                store.clone(),
                access,
                config.license_config(),
                notifier.clone(),
            )
            .with_guard(guard.clone())
            .with_requester(jobs.clone())
            .with_audit(audit.clone()),
        );
        let devices = DeviceRegistry::new(
            store.clone(),
            licenses.clone(),
            keys.clone(),
            config.device_config(),
            notifier.clone(),
        )
        .with_audit(audit.clone());
        let workers = WorkerPool::new(
            store.clone(),
            engine,
            keys.clone(),
            retry,
            config.worker_config(),
            notifier.clone(),
        );

        Self {
            store,
            devices,
            licenses,
            keys,
            guard,
            jobs,
            workers,
            config,
            notifier,
            audit,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &CustodianConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn register_device(
        &self,
        user_id: UserId,
        fingerprint: Fingerprint,
        name: &str,
        platform: Platform,
    ) -> Result<Device> {
        Ok(self
            .devices
            .register(user_id, fingerprint, name, platform, now_millis())
            .await?)
    }

    pub async fn list_devices(&self, user_id: &UserId) -> Result<Vec<Device>> {
        Ok(self.devices.list(user_id).await?)
    }

    pub async fn device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Device> {
        Ok(self.devices.get(user_id, device_id).await?)
    }

    /// Revoke a device, its licenses and its content keys.
    pub async fn deregister_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<()> {
        Ok(self
            .devices
            .deregister(user_id, device_id, now_millis())
            .await?)
    }

    pub fn unblock_device(&self, device_id: &DeviceId) {
        self.guard.unblock(device_id);
    }

    pub fn download_quota(&self, device_id: &DeviceId) -> DownloadQuota {
        self.guard.download_quota(device_id, now_millis())
    }

    /// Downloads of a material left in the current window, across all devices.
    pub fn material_quota(&self, material_id: &MaterialId) -> DownloadQuota {
        self.guard.material_quota(material_id, now_millis())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Licenses
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn issue_license(
        &self,
        user_id: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        fingerprint: &Fingerprint,
    ) -> Result<License> {
        Ok(self
            .licenses
            .issue(user_id, material_id, device_id, fingerprint, now_millis())
            .await?)
    }

    /// Validate a license; the returned license carries the next nonce.
    pub async fn validate_license(
        &self,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
        nonce: &Nonce,
    ) -> Result<License> {
        Ok(self
            .licenses
            .validate(license_id, device_id, fingerprint, nonce, now_millis())
            .await?)
    }

    pub async fn renew_license(
        &self,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
    ) -> Result<License> {
        Ok(self
            .licenses
            .renew(license_id, device_id, fingerprint, now_millis())
            .await?)
    }

    pub async fn revoke_license(&self, license_id: &LicenseId) -> Result<()> {
        Ok(self.licenses.revoke(license_id, now_millis()).await?)
    }

    /// Withdraw a user's entitlement to a material.
    pub async fn revoke_entitlement(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
    ) -> Result<Vec<LicenseId>> {
        Ok(self
            .licenses
            .revoke_by_user_material(user_id, material_id, now_millis())
            .await?)
    }

    /// Take a material down: revoke every license for it and delete every
    /// content key wrapped for it.
    pub async fn withdraw_material(&self, material_id: &MaterialId) -> Result<Vec<LicenseId>> {
        let revoked = self
            .licenses
            .revoke_by_material(material_id, now_millis())
            .await?;
        self.keys.delete_for_material(material_id).await?;
        Ok(revoked)
    }

    pub async fn license(&self, license_id: &LicenseId) -> Result<License> {
        Ok(self.licenses.get(license_id).await?)
    }

    pub async fn active_licenses(&self, user_id: &UserId) -> Result<Vec<License>> {
        Ok(self.licenses.list_active(user_id).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Downloads
    // ─────────────────────────────────────────────────────────────────────────

    /// Authorize a download and hand out the device's content key.
    ///
    /// Order: device blocked, license binding, license belongs to
    /// (user, material), device and material download quota, key present.
    /// Only a successful authorization consumes quota. Every attempt is
    /// audited.
    pub async fn authorize_download(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
    ) -> Result<DownloadGrant> {
        let now = now_millis();
        let result = self
            .authorize_download_at(user_id, material_id, license_id, device_id, fingerprint, now)
            .await;

        let record = match &result {
            Ok(_) => Some(AuditRecord::success(AuditAction::MaterialDownload, *material_id, now)),
            Err(e) => e
                .code()
                .map(|code| AuditRecord::failure(AuditAction::MaterialDownload, *material_id, code, now)),
        };
        if let Some(record) = record {
            self.audit
                .record(record.by_user(*user_id).on_device(*device_id))
                .await;
        }
        result
    }

    async fn authorize_download_at(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        license_id: &LicenseId,
        device_id: &DeviceId,
        fingerprint: &Fingerprint,
        now: i64,
    ) -> Result<DownloadGrant> {
        self.guard.check_not_blocked(device_id, now)?;

        let license = self
            .licenses
            .check_binding(license_id, device_id, fingerprint, now)
            .await?;
        if license.user_id != *user_id || license.material_id != *material_id {
            return Err(AccessError::AccessDenied.into());
        }

        self.guard
            .ensure_download_allowed(device_id, material_id, now)?;

        let key = self
            .keys
            .find(user_id, material_id, device_id)
            .await?
            .ok_or(CustodianError::EncryptionPending)?;

        let quota = self.guard.record_download(device_id, material_id, now)?;
        if let Err(e) = self.devices.touch(device_id, now).await {
            tracing::warn!(device_id = %device_id, error = %e, "failed to update device last use");
        }

        tracing::info!(
            license_id = %license_id,
            material_id = %material_id,
            device_id = %device_id,
            remaining = quota.remaining,
            "download authorized"
        );
        self.notifier.increment("download.authorized");
        self.notifier.publish(
            EventKind::MaterialDownloaded,
            json!({
                "license_id": license_id,
                "user_id": user_id,
                "material_id": material_id,
                "device_id": device_id,
                "key_version": key.key_version,
            }),
            now,
        );

        Ok(DownloadGrant {
            license,
            key,
            quota,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keys and audit
    // ─────────────────────────────────────────────────────────────────────────

    /// Re-wrap every content key at `from_version` and move it to
    /// `to_version`. Keys that fail are left in place and counted.
    pub async fn rotate_keys(
        &self,
        from_version: u32,
        to_version: u32,
        rewrap: &dyn KeyRewrap,
    ) -> Result<RotationReport> {
        Ok(self
            .keys
            .rotate(from_version, to_version, rewrap, now_millis())
            .await?)
    }

    /// A user's audit records, newest first, with the user's total count.
    pub async fn audit_log(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<AuditRecord>, u64)> {
        Ok(self.store.audit_for_user(user_id, limit, offset).await?)
    }

    /// A device's audit records, newest first, with the device's total count.
    pub async fn device_audit_log(
        &self,
        device_id: &DeviceId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<AuditRecord>, u64)> {
        Ok(self.store.audit_for_device(device_id, limit, offset).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Jobs
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn job(&self, job_id: &JobId) -> Result<EncryptionJob> {
        Ok(self.jobs.get_job(job_id).await?)
    }

    pub async fn job_for_license(&self, license_id: &LicenseId) -> Result<EncryptionJob> {
        Ok(self.jobs.get_job_by_license(license_id).await?)
    }

    pub async fn job_for_material(&self, material_id: &MaterialId) -> Result<EncryptionJob> {
        Ok(self.jobs.get_job_by_material(material_id).await?)
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        Ok(self.jobs.job_counts().await?)
    }

    /// Remove completed jobs past the configured retention.
    pub async fn cleanup_jobs(&self) -> Result<u64> {
        Ok(self
            .jobs
            .cleanup_old_jobs(self.config.job_retention(), now_millis())
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Workers
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn start_workers(&self) -> Result<()> {
        Ok(self.workers.start()?)
    }

    pub async fn stop_workers(&self) {
        self.workers.stop().await;
    }

    pub fn workers_running(&self) -> bool {
        self.workers.is_running()
    }
}

//! In-memory implementation of the repository traits.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use custodian_core::{
    AuditRecord, CekId, ContentEncryptionKey, Device, DeviceId, EncryptionJob, Fingerprint, JobId,
    JobStatus, License, LicenseId, LicenseStatus, MaterialId, Nonce, UserId,
};

use crate::error::{Result, StoreError};
use crate::traits::{
    AuditRepository, CekRepository, DeviceInsert, DeviceRepository, JobCounts, JobRepository,
    LicenseInsert, LicenseRepository,
};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock; every
/// mutation takes the single write lock, which makes the compound checks
/// atomic.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    devices: HashMap<DeviceId, Device>,
    licenses: HashMap<LicenseId, License>,
    ceks: HashMap<CekId, ContentEncryptionKey>,
    jobs: HashMap<JobId, EncryptionJob>,
    audit: Vec<AuditRecord>,
}

impl MemoryStoreInner {
    fn upsert_cek(&mut self, cek: &ContentEncryptionKey) -> Result<ContentEncryptionKey> {
        if let Some(device) = self.devices.get(&cek.device_id) {
            if !device.is_active() {
                return Err(StoreError::DeviceRevoked(cek.device_id));
            }
        }

        let composite = cek.composite();
        if let Some(existing) = self.ceks.values_mut().find(|c| c.composite() == composite) {
            existing.wrapped_key = cek.wrapped_key.clone();
            existing.key_version += 1;
            existing.created_at = cek.created_at;
            return Ok(existing.clone());
        }

        self.ceks.insert(cek.id, cek.clone());
        Ok(cek.clone())
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn revoke_where(
    licenses: &mut HashMap<LicenseId, License>,
    at: i64,
    pred: impl Fn(&License) -> bool,
) -> Vec<LicenseId> {
    let mut revoked = Vec::new();
    for license in licenses.values_mut() {
        if license.status == LicenseStatus::Active && pred(license) {
            license.status = LicenseStatus::Revoked;
            license.revoked_at = Some(at);
            revoked.push(license.id);
        }
    }
    revoked
}

fn newest(jobs: impl Iterator<Item = EncryptionJob>) -> Option<EncryptionJob> {
    jobs.max_by_key(|j| j.created_at)
}

#[async_trait]
impl DeviceRepository for MemoryStore {
    async fn register_device(&self, device: &Device, max_active: usize) -> Result<DeviceInsert> {
        let mut inner = self.write()?;

        let active: Vec<&Device> = inner
            .devices
            .values()
            .filter(|d| d.user_id == device.user_id && d.is_active())
            .collect();

        if let Some(existing) = active.iter().find(|d| d.fingerprint == device.fingerprint) {
            return Ok(DeviceInsert::Duplicate {
                existing: existing.id,
            });
        }
        if active.len() >= max_active {
            return Ok(DeviceInsert::LimitReached {
                active: active.len(),
            });
        }

        inner.devices.insert(device.id, device.clone());
        Ok(DeviceInsert::Inserted)
    }

    async fn get_device(&self, id: &DeviceId) -> Result<Option<Device>> {
        Ok(self.read()?.devices.get(id).cloned())
    }

    async fn find_active_by_fingerprint(
        &self,
        user_id: &UserId,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Device>> {
        Ok(self
            .read()?
            .devices
            .values()
            .find(|d| d.user_id == *user_id && d.is_active() && d.fingerprint == *fingerprint)
            .cloned())
    }

    async fn list_active_devices(&self, user_id: &UserId) -> Result<Vec<Device>> {
        let inner = self.read()?;
        let mut devices: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| d.user_id == *user_id && d.is_active())
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.registered_at);
        Ok(devices)
    }

    async fn count_active_devices(&self, user_id: &UserId) -> Result<usize> {
        Ok(self
            .read()?
            .devices
            .values()
            .filter(|d| d.user_id == *user_id && d.is_active())
            .count())
    }

    async fn touch_device(&self, id: &DeviceId, at: i64) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.devices.get_mut(id) {
            Some(device) if device.is_active() => {
                device.last_used_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_device(&self, id: &DeviceId, at: i64) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.devices.get_mut(id) {
            Some(device) if device.is_active() => {
                device.revoked_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl LicenseRepository for MemoryStore {
    async fn insert_license(&self, license: &License) -> Result<LicenseInsert> {
        let mut inner = self.write()?;

        let existing = inner.licenses.values().find(|l| {
            l.status == LicenseStatus::Active
                && l.user_id == license.user_id
                && l.material_id == license.material_id
                && l.device_id == license.device_id
        });
        if let Some(existing) = existing {
            return Ok(LicenseInsert::ActiveExists {
                existing: existing.clone(),
            });
        }

        inner.licenses.insert(license.id, license.clone());
        Ok(LicenseInsert::Inserted)
    }

    async fn get_license(&self, id: &LicenseId) -> Result<Option<License>> {
        Ok(self.read()?.licenses.get(id).cloned())
    }

    async fn find_active_license(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        device_id: &DeviceId,
    ) -> Result<Option<License>> {
        Ok(self
            .read()?
            .licenses
            .values()
            .find(|l| {
                l.status == LicenseStatus::Active
                    && l.user_id == *user_id
                    && l.material_id == *material_id
                    && l.device_id == *device_id
            })
            .cloned())
    }

    async fn list_active_by_device(&self, device_id: &DeviceId) -> Result<Vec<License>> {
        let inner = self.read()?;
        let mut licenses: Vec<License> = inner
            .licenses
            .values()
            .filter(|l| l.status == LicenseStatus::Active && l.device_id == *device_id)
            .cloned()
            .collect();
        licenses.sort_by_key(|l| l.issued_at);
        Ok(licenses)
    }

    async fn list_active_by_user(&self, user_id: &UserId) -> Result<Vec<License>> {
        let inner = self.read()?;
        let mut licenses: Vec<License> = inner
            .licenses
            .values()
            .filter(|l| l.status == LicenseStatus::Active && l.user_id == *user_id)
            .cloned()
            .collect();
        licenses.sort_by_key(|l| l.issued_at);
        Ok(licenses)
    }

    async fn rotate_nonce(
        &self,
        id: &LicenseId,
        expected: &Nonce,
        new: &Nonce,
        at: i64,
    ) -> Result<Option<License>> {
        let mut inner = self.write()?;
        match inner.licenses.get_mut(id) {
            Some(license) if license.status == LicenseStatus::Active && license.nonce == *expected => {
                license.nonce = new.clone();
                license.last_validated_at = at;
                Ok(Some(license.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn extend_expiry(&self, id: &LicenseId, expires_at: i64) -> Result<Option<License>> {
        let mut inner = self.write()?;
        match inner.licenses.get_mut(id) {
            Some(license) if license.status == LicenseStatus::Active => {
                license.expires_at = expires_at;
                Ok(Some(license.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_license(&self, id: &LicenseId, at: i64) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(!revoke_where(&mut inner.licenses, at, |l| l.id == *id).is_empty())
    }

    async fn revoke_by_device(&self, device_id: &DeviceId, at: i64) -> Result<Vec<LicenseId>> {
        let mut inner = self.write()?;
        Ok(revoke_where(&mut inner.licenses, at, |l| {
            l.device_id == *device_id
        }))
    }

    async fn revoke_by_material(
        &self,
        material_id: &MaterialId,
        at: i64,
    ) -> Result<Vec<LicenseId>> {
        let mut inner = self.write()?;
        Ok(revoke_where(&mut inner.licenses, at, |l| {
            l.material_id == *material_id
        }))
    }

    async fn revoke_by_user_material(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        at: i64,
    ) -> Result<Vec<LicenseId>> {
        let mut inner = self.write()?;
        Ok(revoke_where(&mut inner.licenses, at, |l| {
            l.user_id == *user_id && l.material_id == *material_id
        }))
    }
}

#[async_trait]
impl CekRepository for MemoryStore {
    async fn upsert_cek(&self, cek: &ContentEncryptionKey) -> Result<ContentEncryptionKey> {
        self.write()?.upsert_cek(cek)
    }

    async fn upsert_licensed_cek(
        &self,
        cek: &ContentEncryptionKey,
        license_id: &LicenseId,
    ) -> Result<Option<ContentEncryptionKey>> {
        let mut inner = self.write()?;

        let bound = inner.licenses.get(license_id).is_some_and(|l| {
            l.status == LicenseStatus::Active
                && (l.user_id, l.material_id, l.device_id) == cek.composite()
        });
        let device_active = inner
            .devices
            .get(&cek.device_id)
            .is_some_and(Device::is_active);
        if !bound || !device_active {
            return Ok(None);
        }

        inner.upsert_cek(cek).map(Some)
    }

    async fn list_ceks_by_version(&self, key_version: u32) -> Result<Vec<ContentEncryptionKey>> {
        let inner = self.read()?;
        let mut ceks: Vec<ContentEncryptionKey> = inner
            .ceks
            .values()
            .filter(|c| c.key_version == key_version)
            .cloned()
            .collect();
        ceks.sort_by_key(|c| c.created_at);
        Ok(ceks)
    }

    async fn rewrap_cek(
        &self,
        id: &CekId,
        expected_version: u32,
        wrapped_key: &[u8],
        new_version: u32,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.ceks.get_mut(id) {
            Some(cek) if cek.key_version == expected_version => {
                cek.wrapped_key = wrapped_key.to_vec();
                cek.key_version = new_version;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_cek(&self, id: &CekId) -> Result<Option<ContentEncryptionKey>> {
        Ok(self.read()?.ceks.get(id).cloned())
    }

    async fn find_cek(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        device_id: &DeviceId,
    ) -> Result<Option<ContentEncryptionKey>> {
        let composite = (*user_id, *material_id, *device_id);
        Ok(self
            .read()?
            .ceks
            .values()
            .find(|c| c.composite() == composite)
            .cloned())
    }

    async fn delete_by_device(&self, device_id: &DeviceId) -> Result<u64> {
        let mut inner = self.write()?;
        let before = inner.ceks.len();
        inner.ceks.retain(|_, c| c.device_id != *device_id);
        Ok((before - inner.ceks.len()) as u64)
    }

    async fn delete_by_material(&self, material_id: &MaterialId) -> Result<u64> {
        let mut inner = self.write()?;
        let before = inner.ceks.len();
        inner.ceks.retain(|_, c| c.material_id != *material_id);
        Ok((before - inner.ceks.len()) as u64)
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert_job(&self, job: &EncryptionJob) -> Result<()> {
        self.write()?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<EncryptionJob>> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    async fn latest_job_for_material(
        &self,
        material_id: &MaterialId,
    ) -> Result<Option<EncryptionJob>> {
        let inner = self.read()?;
        Ok(newest(
            inner
                .jobs
                .values()
                .filter(|j| j.material_id == *material_id)
                .cloned(),
        ))
    }

    async fn latest_job_for_license(
        &self,
        license_id: &LicenseId,
    ) -> Result<Option<EncryptionJob>> {
        let inner = self.read()?;
        Ok(newest(
            inner
                .jobs
                .values()
                .filter(|j| j.license_id == *license_id)
                .cloned(),
        ))
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<EncryptionJob>> {
        let inner = self.read()?;
        let mut pending: Vec<EncryptionJob> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| (j.priority, j.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn job_counts(&self) -> Result<JobCounts> {
        let inner = self.read()?;
        let mut counts = JobCounts::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn claim_job(&self, id: &JobId, at: i64) -> Result<Option<EncryptionJob>> {
        let mut inner = self.write()?;
        match inner.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.started_at = Some(at);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete_job(&self, id: &JobId, at: i64) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(at);
                job.error_message = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_job(&self, id: &JobId, error: &str, at: i64) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(at);
                job.error_message = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retry_job(&self, id: &JobId, error: &str, max_retries: u32) -> Result<Option<u32>> {
        let mut inner = self.write()?;
        match inner.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Processing && job.can_retry(max_retries) => {
                job.retry_count += 1;
                job.error_message = Some(error.to_string());
                Ok(Some(job.retry_count))
            }
            _ => Ok(None),
        }
    }

    async fn release_job(&self, id: &JobId) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Pending;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_completed_before(&self, cutoff: i64) -> Result<u64> {
        let mut inner = self.write()?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| !j.is_purgeable(cutoff));
        Ok((before - inner.jobs.len()) as u64)
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.write()?.audit.push(record.clone());
        Ok(())
    }

    async fn audit_for_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<AuditRecord>, u64)> {
        let inner = self.read()?;
        Ok(page(
            inner.audit.iter().filter(|r| r.user_id == Some(*user_id)),
            limit,
            offset,
        ))
    }

    async fn audit_for_device(
        &self,
        device_id: &DeviceId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<AuditRecord>, u64)> {
        let inner = self.read()?;
        Ok(page(
            inner.audit.iter().filter(|r| r.device_id == Some(*device_id)),
            limit,
            offset,
        ))
    }
}

fn page<'a>(
    records: impl Iterator<Item = &'a AuditRecord>,
    limit: usize,
    offset: usize,
) -> (Vec<AuditRecord>, u64) {
    // Newest first; among equal timestamps the later append wins.
    let mut all: Vec<&AuditRecord> = records.collect();
    all.reverse();
    all.sort_by_key(|r| std::cmp::Reverse(r.created_at));
    let total = all.len() as u64;
    let page = all.into_iter().skip(offset).take(limit).cloned().collect();
    (page, total)
}

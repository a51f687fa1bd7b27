//! Repository traits: the abstract interface for Custodian persistence.
//!
//! One trait per entity. Services hold `Arc<dyn ...Repository>` handles and
//! never see a concrete backend. Every operation that enforces an invariant
//! (device cap, single active license, nonce rotation, job claim) is a single
//! atomic call so that concurrent callers cannot interleave check and write.

use async_trait::async_trait;
use custodian_core::{
    AuditRecord, CekId, ContentEncryptionKey, Device, DeviceId, EncryptionJob, Fingerprint, JobId,
    License, LicenseId, MaterialId, Nonce, UserId,
};

use crate::error::Result;

/// Result of registering a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceInsert {
    /// Device was stored.
    Inserted,
    /// An active device with the same fingerprint already exists for the user.
    Duplicate {
        /// The existing device.
        existing: DeviceId,
    },
    /// The user already has the maximum number of active devices.
    LimitReached {
        /// Number of active devices at the time of the attempt.
        active: usize,
    },
}

/// Result of inserting a license.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseInsert {
    /// License was stored.
    Inserted,
    /// An active license already exists for the (user, material, device) triple.
    ActiveExists {
        /// The license that won.
        existing: License,
    },
}

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Device persistence.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Register a device.
    ///
    /// The duplicate-fingerprint and active-device-cap checks run atomically
    /// with the insert.
    async fn register_device(&self, device: &Device, max_active: usize) -> Result<DeviceInsert>;

    /// Get a device by id, revoked or not.
    async fn get_device(&self, id: &DeviceId) -> Result<Option<Device>>;

    /// Find the active device with this fingerprint for a user.
    async fn find_active_by_fingerprint(
        &self,
        user_id: &UserId,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Device>>;

    /// List a user's active devices, oldest registration first.
    async fn list_active_devices(&self, user_id: &UserId) -> Result<Vec<Device>>;

    /// Count a user's active devices.
    async fn count_active_devices(&self, user_id: &UserId) -> Result<usize>;

    /// Update last-used-at. Returns false for unknown or revoked devices.
    async fn touch_device(&self, id: &DeviceId, at: i64) -> Result<bool>;

    /// Tombstone a device. Returns false if it was unknown or already revoked.
    async fn revoke_device(&self, id: &DeviceId, at: i64) -> Result<bool>;
}

/// License persistence.
#[async_trait]
pub trait LicenseRepository: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Creation and lookup
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a license, refusing a second active license for the same triple.
    async fn insert_license(&self, license: &License) -> Result<LicenseInsert>;

    async fn get_license(&self, id: &LicenseId) -> Result<Option<License>>;

    /// The active license for a (user, material, device) triple, if any.
    async fn find_active_license(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        device_id: &DeviceId,
    ) -> Result<Option<License>>;

    async fn list_active_by_device(&self, device_id: &DeviceId) -> Result<Vec<License>>;

    async fn list_active_by_user(&self, user_id: &UserId) -> Result<Vec<License>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────────────────

    /// Compare-and-swap the nonce.
    ///
    /// Succeeds only if the license is active and its stored nonce equals
    /// `expected`; sets the new nonce and last-validated-at. Returns the updated
    /// license, or `None` if the swap lost.
    async fn rotate_nonce(
        &self,
        id: &LicenseId,
        expected: &Nonce,
        new: &Nonce,
        at: i64,
    ) -> Result<Option<License>>;

    /// Move expires-at on an active license. Returns `None` if not active.
    async fn extend_expiry(&self, id: &LicenseId, expires_at: i64) -> Result<Option<License>>;

    /// Revoke one license. Returns false if it was unknown or already revoked.
    async fn revoke_license(&self, id: &LicenseId, at: i64) -> Result<bool>;

    /// Revoke every active license bound to a device.
    async fn revoke_by_device(&self, device_id: &DeviceId, at: i64) -> Result<Vec<LicenseId>>;

    /// Revoke every active license for a material.
    async fn revoke_by_material(&self, material_id: &MaterialId, at: i64)
        -> Result<Vec<LicenseId>>;

    /// Revoke every active license a user holds for a material.
    async fn revoke_by_user_material(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        at: i64,
    ) -> Result<Vec<LicenseId>>;
}

/// Content-key persistence.
#[async_trait]
pub trait CekRepository: Send + Sync {
    /// Store a key. If one already exists for the composite key it is
    /// superseded: the wrapped bytes are replaced and the version bumped.
    ///
    /// Fails with `StoreError::DeviceRevoked` if the key's device is known and
    /// revoked. Returns the record as stored.
    async fn upsert_cek(&self, cek: &ContentEncryptionKey) -> Result<ContentEncryptionKey>;

    /// Store a key on behalf of a license.
    ///
    /// Writes only while `license_id` is active and bound to the key's
    /// (user, material, device) and the device is active; returns `None`
    /// otherwise. The check and the write are one atomic step, so a key can
    /// never outlive a concurrent revocation.
    async fn upsert_licensed_cek(
        &self,
        cek: &ContentEncryptionKey,
        license_id: &LicenseId,
    ) -> Result<Option<ContentEncryptionKey>>;

    /// Every key currently at `key_version`.
    async fn list_ceks_by_version(&self, key_version: u32) -> Result<Vec<ContentEncryptionKey>>;

    /// Replace a key's wrapped bytes and set its version, but only if it is
    /// still at `expected_version`. Returns false if the key is gone or was
    /// superseded in between.
    async fn rewrap_cek(
        &self,
        id: &CekId,
        expected_version: u32,
        wrapped_key: &[u8],
        new_version: u32,
    ) -> Result<bool>;

    async fn get_cek(&self, id: &CekId) -> Result<Option<ContentEncryptionKey>>;

    async fn find_cek(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
        device_id: &DeviceId,
    ) -> Result<Option<ContentEncryptionKey>>;

    /// Delete every key bound to a device. Returns the number removed.
    async fn delete_by_device(&self, device_id: &DeviceId) -> Result<u64>;

    /// Delete every key for a material. Returns the number removed.
    async fn delete_by_material(&self, material_id: &MaterialId) -> Result<u64>;
}

/// Encryption-job persistence.
#[async_trait]
pub trait JobRepository: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Creation and lookup
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &EncryptionJob) -> Result<()>;

    async fn get_job(&self, id: &JobId) -> Result<Option<EncryptionJob>>;

    /// Most recently created job for a material.
    async fn latest_job_for_material(&self, material_id: &MaterialId)
        -> Result<Option<EncryptionJob>>;

    /// Most recently created job for a license.
    async fn latest_job_for_license(&self, license_id: &LicenseId)
        -> Result<Option<EncryptionJob>>;

    /// Up to `limit` pending jobs, highest priority first, then oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<EncryptionJob>>;

    async fn job_counts(&self) -> Result<JobCounts>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Atomically move a job Pending -> Processing and set started-at.
    ///
    /// Returns `None` if another worker got there first.
    async fn claim_job(&self, id: &JobId, at: i64) -> Result<Option<EncryptionJob>>;

    /// Processing -> Completed. Returns false if the job was not processing.
    async fn complete_job(&self, id: &JobId, at: i64) -> Result<bool>;

    /// Processing -> Failed with the error text. Returns false if the job was
    /// not processing.
    async fn fail_job(&self, id: &JobId, error: &str, at: i64) -> Result<bool>;

    /// Record a failed attempt on a processing job.
    ///
    /// Increments retry-count only while it is below `max_retries`. Returns the
    /// new count, or `None` if the job was not processing or out of retries.
    async fn retry_job(&self, id: &JobId, error: &str, max_retries: u32) -> Result<Option<u32>>;

    /// Processing -> Pending so the job can be claimed again.
    async fn release_job(&self, id: &JobId) -> Result<bool>;

    /// Delete Completed jobs whose completed-at is before `cutoff`.
    async fn delete_completed_before(&self, cutoff: i64) -> Result<u64>;
}

/// Append-only security audit trail.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append_audit(&self, record: &AuditRecord) -> Result<()>;

    /// A page of a user's records, newest first, and the user's total count.
    async fn audit_for_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<AuditRecord>, u64)>;

    /// A page of a device's records, newest first, and the device's total count.
    async fn audit_for_device(
        &self,
        device_id: &DeviceId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<AuditRecord>, u64)>;
}

/// A backend providing every repository.
pub trait Store:
    DeviceRepository + LicenseRepository + CekRepository + JobRepository + AuditRepository
{
}

impl<T> Store for T where
    T: DeviceRepository + LicenseRepository + CekRepository + JobRepository + AuditRepository
{
}

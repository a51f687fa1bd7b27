//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;

use custodian_core::{
    Device, DeviceId, EncryptionJob, Fingerprint, JobPriority, License, MaterialId, Platform,
    UserId,
};
use custodian_store::MemoryStore;

/// Deterministic valid fingerprint: 64 hex characters derived from `seed`.
pub fn fingerprint(seed: u8) -> Fingerprint {
    Fingerprint::from_raw(hex::encode([seed; 32]))
}

/// Random valid fingerprint.
pub fn random_fingerprint() -> Fingerprint {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    Fingerprint::from_raw(hex::encode(bytes))
}

/// A user with a memory store, for building entities by hand.
pub struct TestFixture {
    pub user_id: UserId,
    pub store: Arc<MemoryStore>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self {
            user_id: UserId::new(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// An unregistered device for this user.
    pub fn make_device(&self, seed: u8, now: i64) -> Device {
        Device {
            id: DeviceId::new(),
            user_id: self.user_id,
            fingerprint: fingerprint(seed),
            name: format!("device-{seed}"),
            platform: Platform::Android,
            registered_at: now,
            last_used_at: now,
            revoked_at: None,
        }
    }

    /// An unpersisted active license for `device`, valid for 30 days with a
    /// 72 hour grace period.
    pub fn make_license(&self, device: &Device, material_id: MaterialId, now: i64) -> License {
        License::issue(
            self.user_id,
            material_id,
            device.id,
            Duration::from_secs(30 * 24 * 3600),
            Duration::from_secs(72 * 3600),
            now,
        )
    }

    /// An unpersisted pending job for `license`.
    pub fn make_job(&self, license: &License, priority: JobPriority, now: i64) -> EncryptionJob {
        EncryptionJob::new(
            license.material_id,
            license.user_id,
            license.device_id,
            license.id,
            priority,
            now,
        )
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixtures for several users sharing one store.
pub fn multi_user_fixtures(count: usize) -> Vec<TestFixture> {
    let store = Arc::new(MemoryStore::new());
    (0..count)
        .map(|_| TestFixture {
            user_id: UserId::new(),
            store: store.clone(),
        })
        .collect()
}

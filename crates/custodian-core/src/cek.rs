//! Content encryption keys.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{CekId, DeviceId, MaterialId, UserId};

/// A content key wrapped for one device.
///
/// Unique per (user, material, device). Rotation supersedes the record with a
/// higher `key_version` under the same composite key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEncryptionKey {
    pub id: CekId,
    pub user_id: UserId,
    pub material_id: MaterialId,
    pub device_id: DeviceId,
    pub wrapped_key: Vec<u8>,
    pub key_version: u32,
    pub created_at: i64,
}

impl ContentEncryptionKey {
    /// Create a first-version key record.
    pub fn new(
        user_id: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        wrapped_key: Vec<u8>,
        now: i64,
    ) -> Self {
        Self {
            id: CekId::new(),
            user_id,
            material_id,
            device_id,
            wrapped_key,
            key_version: 1,
            created_at: now,
        }
    }

    /// The composite lookup key.
    pub fn composite(&self) -> (UserId, MaterialId, DeviceId) {
        (self.user_id, self.material_id, self.device_id)
    }
}

// Wrapped key material stays out of logs.
impl fmt::Debug for ContentEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentEncryptionKey")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("material_id", &self.material_id)
            .field("device_id", &self.device_id)
            .field("wrapped_key", &format_args!("<{} bytes>", self.wrapped_key.len()))
            .field("key_version", &self.key_version)
            .field("created_at", &self.created_at)
            .finish()
    }
}

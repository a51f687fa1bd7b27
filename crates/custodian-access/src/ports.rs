//! Collaborators the access layer consumes but does not own.

use async_trait::async_trait;
use custodian_core::{ContentEncryptionKey, JobId, JobPriority, License, MaterialId, UserId};
use thiserror::Error;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PortError(pub String);

impl PortError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Material entitlement check.
///
/// An error is treated the same as a denial.
#[async_trait]
pub trait AccessChecker: Send + Sync {
    async fn check_access(
        &self,
        user_id: &UserId,
        material_id: &MaterialId,
    ) -> std::result::Result<bool, PortError>;
}

/// Enqueues per-device encryption work for a freshly issued license.
#[async_trait]
pub trait EncryptionRequester: Send + Sync {
    async fn request_encryption(
        &self,
        license: &License,
        priority: JobPriority,
        now: i64,
    ) -> std::result::Result<JobId, PortError>;
}

/// Re-wraps a content key for a new key version.
///
/// Returns the new wrapped bytes; the plaintext key never leaves the
/// implementation.
#[async_trait]
pub trait KeyRewrap: Send + Sync {
    async fn rewrap(
        &self,
        cek: &ContentEncryptionKey,
        to_version: u32,
    ) -> std::result::Result<Vec<u8>, PortError>;
}

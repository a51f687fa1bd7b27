//! Encryption engine port.
//!
//! The worker pool hands each claimed job to an [`EncryptionEngine`], which
//! produces the device-specific encrypted artifact and the content key wrapped
//! for that device. The pool only persists the wrapped key; where the artifact
//! lives is the engine's business.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use custodian_access::PortError;
use custodian_core::{DeviceId, EncryptionJob, JobId, LicenseId, MaterialId, UserId};

/// What to encrypt, and for whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionRequest {
    pub job_id: JobId,
    pub material_id: MaterialId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub license_id: LicenseId,
}

impl From<&EncryptionJob> for EncryptionRequest {
    fn from(job: &EncryptionJob) -> Self {
        Self {
            job_id: job.id,
            material_id: job.material_id,
            user_id: job.user_id,
            device_id: job.device_id,
            license_id: job.license_id,
        }
    }
}

/// Result of a successful encryption.
#[derive(Debug, Clone)]
pub struct EncryptionOutput {
    /// Content key wrapped for the target device.
    pub wrapped_key: Vec<u8>,
    /// Encrypted material.
    pub artifact: Bytes,
}

/// Errors reported by an engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("material not found: {0}")]
    MaterialNotFound(MaterialId),

    #[error("device not registered: {0}")]
    DeviceNotFound(DeviceId),

    #[error("material source: {0}")]
    Source(String),

    #[error("crypto: {0}")]
    Crypto(String),
}

impl From<EngineError> for PortError {
    fn from(e: EngineError) -> Self {
        PortError::new(e.to_string())
    }
}

/// Produces encrypted artifacts and wrapped content keys.
///
/// Implementations must be thread-safe; several worker units call `encrypt`
/// concurrently.
#[async_trait]
pub trait EncryptionEngine: Send + Sync {
    async fn encrypt(&self, request: &EncryptionRequest) -> Result<EncryptionOutput, EngineError>;
}

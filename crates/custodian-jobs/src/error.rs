//! Error types for the job pipeline.

use std::time::Duration;

use custodian_access::AccessError;
use custodian_core::LicenseId;
use thiserror::Error;

use crate::engine::EngineError;

/// Errors that can occur while managing or running encryption jobs.
#[derive(Debug, Error)]
pub enum JobError {
    /// The worker pool is already started (or still stopping).
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// No job matched the lookup.
    #[error("encryption job not found")]
    JobNotFound,

    /// Repository operation failed.
    #[error("store error: {0}")]
    Store(#[from] custodian_store::StoreError),

    /// Storing the produced content key failed.
    #[error("content key store: {0}")]
    KeyStore(#[from] AccessError),

    /// The license or its device was revoked while the job ran; the produced
    /// key was discarded.
    #[error("license {0} or its device was revoked, content key discarded")]
    BindingRevoked(LicenseId),

    /// The engine reported a failure. Displayed verbatim.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The engine did not finish within the job timeout.
    #[error("encryption timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    /// Whether running the job again could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::BindingRevoked(_) | JobError::KeyStore(AccessError::DeviceRevoked)
        )
    }
}

/// Result type for job operations.
pub type Result<T> = std::result::Result<T, JobError>;

//! Error types for the Custodian facade.

use std::time::Duration;

use custodian_access::{AccessError, ErrorKind};
use custodian_jobs::JobError;
use custodian_store::StoreError;
use thiserror::Error;

/// Errors that can occur during Custodian operations.
#[derive(Debug, Error)]
pub enum CustodianError {
    /// Device, license or abuse-policy error.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// Job lookup or worker lifecycle error.
    #[error(transparent)]
    Job(#[from] JobError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The license is valid but its encrypted copy has not been produced yet.
    #[error("encryption pending: content key not yet available")]
    EncryptionPending,
}

impl CustodianError {
    /// Suggested HTTP status for the surrounding API layer.
    pub fn http_status(&self) -> u16 {
        match self {
            CustodianError::Access(e) => e.http_status(),
            CustodianError::Job(JobError::JobNotFound) => 404,
            CustodianError::Job(JobError::AlreadyRunning) => 409,
            CustodianError::Job(_) | CustodianError::Store(_) => 500,
            CustodianError::EncryptionPending => 404,
        }
    }

    /// Broad category, where one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CustodianError::Access(e) => Some(e.kind()),
            CustodianError::Job(JobError::JobNotFound) | CustodianError::EncryptionPending => {
                Some(ErrorKind::NotFound)
            }
            CustodianError::Store(_) => Some(ErrorKind::Transient),
            CustodianError::Job(_) => None,
        }
    }

    /// Stable code recorded in the audit trail; `None` for backend failures.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            CustodianError::Access(AccessError::Store(_)) => None,
            CustodianError::Access(e) => Some(e.code()),
            CustodianError::EncryptionPending => Some("encryption_pending"),
            CustodianError::Job(_) | CustodianError::Store(_) => None,
        }
    }

    /// How long the caller should wait before retrying, for abuse rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CustodianError::Access(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Result type for Custodian operations.
pub type Result<T> = std::result::Result<T, CustodianError>;

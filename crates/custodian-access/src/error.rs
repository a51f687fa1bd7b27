//! Error types for the access module.

use std::time::Duration;

use custodian_core::{CoreError, LicenseViolation};
use custodian_store::StoreError;
use thiserror::Error;

/// Coarse classification used by callers to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown device, license or key. Not retryable.
    NotFound,
    /// License/device binding rejected. Never retried automatically.
    Binding,
    /// Policy refused the request; the caller must remediate.
    Policy,
    /// Rate limited or blocked; retry after a delay.
    Abuse,
    /// Backend failure.
    Transient,
    /// Malformed input.
    Invalid,
}

/// Errors that can occur during access-control operations.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("device not registered")]
    DeviceNotRegistered,

    #[error("license not found")]
    LicenseNotFound,

    #[error("device has been revoked")]
    DeviceRevoked,

    #[error("device id or fingerprint does not match the license binding")]
    DeviceMismatch,

    #[error("invalid or already used nonce")]
    InvalidNonce,

    #[error("license has expired")]
    LicenseExpired,

    #[error("offline grace period exceeded, revalidate online")]
    GracePeriodExceeded,

    #[error("license has been revoked")]
    LicenseRevoked,

    #[error("maximum number of active devices ({max}) reached")]
    DeviceLimitExceeded { max: usize },

    #[error("device with this fingerprint is already registered")]
    DuplicateDevice,

    #[error("access to material denied")]
    AccessDenied,

    #[error("download rate limit exceeded, retry in {}s", retry_after.as_secs())]
    RateLimitExceeded { retry_after: Duration },

    #[error("download limit for this material exceeded, retry in {}s", retry_after.as_secs())]
    MaterialRateLimitExceeded { retry_after: Duration },

    #[error("device is temporarily blocked, retry in {}s", retry_after.as_secs())]
    DeviceBlocked { retry_after: Duration },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid input: {0}")]
    Invalid(#[from] CoreError),
}

impl AccessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccessError::DeviceNotRegistered | AccessError::LicenseNotFound => ErrorKind::NotFound,
            AccessError::DeviceRevoked
            | AccessError::DeviceMismatch
            | AccessError::InvalidNonce
            | AccessError::LicenseExpired
            | AccessError::GracePeriodExceeded
            | AccessError::LicenseRevoked => ErrorKind::Binding,
            AccessError::DeviceLimitExceeded { .. }
            | AccessError::DuplicateDevice
            | AccessError::AccessDenied => ErrorKind::Policy,
            AccessError::RateLimitExceeded { .. }
            | AccessError::MaterialRateLimitExceeded { .. }
            | AccessError::DeviceBlocked { .. } => ErrorKind::Abuse,
            AccessError::Store(_) => ErrorKind::Transient,
            AccessError::Invalid(_) => ErrorKind::Invalid,
        }
    }

    /// HTTP status hint for the surrounding API layer.
    pub fn http_status(&self) -> u16 {
        match self {
            AccessError::DuplicateDevice => 409,
            _ => match self.kind() {
                ErrorKind::NotFound => 404,
                ErrorKind::Binding | ErrorKind::Policy => 403,
                ErrorKind::Abuse => 429,
                ErrorKind::Transient => 500,
                ErrorKind::Invalid => 400,
            },
        }
    }

    /// How long the caller should wait, for abuse rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AccessError::RateLimitExceeded { retry_after }
            | AccessError::MaterialRateLimitExceeded { retry_after }
            | AccessError::DeviceBlocked { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable machine-readable code, recorded in the audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            AccessError::DeviceNotRegistered => "device_not_registered",
            AccessError::LicenseNotFound => "license_not_found",
            AccessError::DeviceRevoked => "device_revoked",
            AccessError::DeviceMismatch => "device_mismatch",
            AccessError::InvalidNonce => "invalid_nonce",
            AccessError::LicenseExpired => "license_expired",
            AccessError::GracePeriodExceeded => "grace_period_exceeded",
            AccessError::LicenseRevoked => "license_revoked",
            AccessError::DeviceLimitExceeded { .. } => "device_limit_exceeded",
            AccessError::DuplicateDevice => "duplicate_device",
            AccessError::AccessDenied => "access_denied",
            AccessError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AccessError::MaterialRateLimitExceeded { .. } => "material_rate_limit_exceeded",
            AccessError::DeviceBlocked { .. } => "device_blocked",
            AccessError::Store(_) => "store_error",
            AccessError::Invalid(_) => "invalid_input",
        }
    }
}

impl From<LicenseViolation> for AccessError {
    fn from(violation: LicenseViolation) -> Self {
        match violation {
            LicenseViolation::Revoked => AccessError::LicenseRevoked,
            LicenseViolation::DeviceMismatch => AccessError::DeviceMismatch,
            LicenseViolation::Expired => AccessError::LicenseExpired,
            LicenseViolation::GracePeriodExceeded => AccessError::GracePeriodExceeded,
            LicenseViolation::InvalidNonce => AccessError::InvalidNonce,
        }
    }
}

/// Result type for access operations.
pub type Result<T> = std::result::Result<T, AccessError>;

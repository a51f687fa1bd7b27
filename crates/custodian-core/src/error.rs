//! Error types for Custodian Core.

use thiserror::Error;

/// Errors raised while constructing or parsing domain values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("fingerprint must be between 32 and 512 characters, got {len}")]
    InvalidFingerprint { len: usize },

    #[error("device name must be between 1 and 255 characters, got {len}")]
    InvalidDeviceName { len: usize },

    #[error("platform must be one of: ios, android, desktop (got {0:?})")]
    InvalidPlatform(String),

    #[error("unknown {kind} value: {value}")]
    UnknownEnumValue { kind: &'static str, value: String },

    #[error("key rotation must move to a newer version (from {from} to {to})")]
    InvalidKeyVersion { from: u32, to: u32 },
}

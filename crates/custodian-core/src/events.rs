//! Domain notifications.
//!
//! Publishing is best-effort: callers log a [`PublishError`] and carry on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Notification subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    LicenseIssued,
    LicenseValidated,
    LicenseRenewed,
    LicenseRevoked,
    DeviceRegistered,
    DeviceDeregistered,
    EncryptionRequested,
    EncryptionCompleted,
    EncryptionFailed,
    KeyGenerated,
    MaterialDownloaded,
}

impl EventKind {
    /// Dotted subject string used on the bus.
    pub const fn subject(&self) -> &'static str {
        match self {
            EventKind::LicenseIssued => "offline.license.issued",
            EventKind::LicenseValidated => "offline.license.validated",
            EventKind::LicenseRenewed => "offline.license.renewed",
            EventKind::LicenseRevoked => "offline.license.revoked",
            EventKind::DeviceRegistered => "offline.device.registered",
            EventKind::DeviceDeregistered => "offline.device.deregistered",
            EventKind::EncryptionRequested => "offline.encryption.requested",
            EventKind::EncryptionCompleted => "offline.encryption.completed",
            EventKind::EncryptionFailed => "offline.encryption.failed",
            EventKind::KeyGenerated => "offline.key.generated",
            EventKind::MaterialDownloaded => "offline.material.downloaded",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subject())
    }
}

/// A published notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub occurred_at: i64,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value, occurred_at: i64) -> Self {
        Self {
            kind,
            payload,
            occurred_at,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to publish {subject}: {reason}")]
pub struct PublishError {
    pub subject: &'static str,
    pub reason: String,
}

impl PublishError {
    pub fn new(kind: EventKind, reason: impl Into<String>) -> Self {
        Self {
            subject: kind.subject(),
            reason: reason.into(),
        }
    }
}

/// Sink for domain notifications.
///
/// Implementations must not block: hand the event to a queue or drop it.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &Event) -> Result<(), PublishError>;
}

/// Publisher that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: &Event) -> Result<(), PublishError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_are_namespaced() {
        let kinds = [
            EventKind::LicenseIssued,
            EventKind::DeviceDeregistered,
            EventKind::EncryptionFailed,
            EventKind::MaterialDownloaded,
        ];
        for kind in kinds {
            assert!(kind.subject().starts_with("offline."));
        }
        assert_eq!(EventKind::KeyGenerated.to_string(), "offline.key.generated");
    }

    #[test]
    fn test_publish_error_names_subject() {
        let err = PublishError::new(EventKind::LicenseRenewed, "bus down");
        assert_eq!(
            err.to_string(),
            "failed to publish offline.license.renewed: bus down"
        );
    }
}

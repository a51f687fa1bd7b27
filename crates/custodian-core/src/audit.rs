//! Security audit records.
//!
//! Every security-relevant decision (device and license lifecycle, blocks, key
//! handling, downloads) leaves one record, successful or not.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{AuditId, DeviceId, UserId};

/// What was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    DeviceRegister,
    DeviceDeregister,
    DeviceBlock,
    LicenseIssue,
    LicenseValidate,
    LicenseRenew,
    LicenseRevoke,
    KeyGenerate,
    KeyRotate,
    MaterialDownload,
}

impl AuditAction {
    pub const ALL: [AuditAction; 10] = [
        AuditAction::DeviceRegister,
        AuditAction::DeviceDeregister,
        AuditAction::DeviceBlock,
        AuditAction::LicenseIssue,
        AuditAction::LicenseValidate,
        AuditAction::LicenseRenew,
        AuditAction::LicenseRevoke,
        AuditAction::KeyGenerate,
        AuditAction::KeyRotate,
        AuditAction::MaterialDownload,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            AuditAction::DeviceRegister => "device.register",
            AuditAction::DeviceDeregister => "device.deregister",
            AuditAction::DeviceBlock => "device.block",
            AuditAction::LicenseIssue => "license.issue",
            AuditAction::LicenseValidate => "license.validate",
            AuditAction::LicenseRenew => "license.renew",
            AuditAction::LicenseRevoke => "license.revoke",
            AuditAction::KeyGenerate => "key.generate",
            AuditAction::KeyRotate => "key.rotate",
            AuditAction::MaterialDownload => "material.download",
        }
    }

    /// Kind of entity `resource_id` refers to.
    pub const fn resource(&self) -> &'static str {
        match self {
            AuditAction::DeviceRegister | AuditAction::DeviceDeregister | AuditAction::DeviceBlock => {
                "device"
            }
            AuditAction::LicenseIssue
            | AuditAction::LicenseValidate
            | AuditAction::LicenseRenew
            | AuditAction::LicenseRevoke => "license",
            AuditAction::KeyGenerate | AuditAction::KeyRotate => "cek",
            AuditAction::MaterialDownload => "material",
        }
    }
}

impl FromStr for AuditAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEnumValue {
                kind: "audit action",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit trail entry.
///
/// `user_id` is absent when the actor could not be resolved, e.g. a validation
/// against an unknown license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: AuditId,
    pub user_id: Option<UserId>,
    pub device_id: Option<DeviceId>,
    pub action: AuditAction,
    pub resource_id: Uuid,
    pub success: bool,
    /// Stable error text for failed attempts.
    pub error_code: Option<String>,
    pub created_at: i64,
}

impl AuditRecord {
    /// A successful action.
    pub fn success(action: AuditAction, resource_id: impl Into<Uuid>, now: i64) -> Self {
        Self {
            id: AuditId::new(),
            user_id: None,
            device_id: None,
            action,
            resource_id: resource_id.into(),
            success: true,
            error_code: None,
            created_at: now,
        }
    }

    /// A refused or failed action.
    pub fn failure(
        action: AuditAction,
        resource_id: impl Into<Uuid>,
        error_code: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            success: false,
            error_code: Some(error_code.into()),
            ..Self::success(action, resource_id, now)
        }
    }

    pub fn by_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn on_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }
}

//! Offline licenses.
//!
//! A license binds (user, material, device). Expiry and offline-grace
//! violations are never stored as states: they are computed from timestamps at
//! the moment of validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;
use crate::time::{add_duration, duration_millis};
use crate::types::{DeviceId, LicenseId, MaterialId, Nonce, UserId};

/// Persisted license status. `Revoked` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Revoked,
}

impl LicenseStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Active => "active",
            LicenseStatus::Revoked => "revoked",
        }
    }
}

impl FromStr for LicenseStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LicenseStatus::Active),
            "revoked" => Ok(LicenseStatus::Revoked),
            other => Err(CoreError::UnknownEnumValue {
                kind: "license status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a license cannot be used right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseViolation {
    Revoked,
    DeviceMismatch,
    Expired,
    GracePeriodExceeded,
    InvalidNonce,
}

/// A time-boxed, device-bound offline license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub id: LicenseId,
    pub user_id: UserId,
    pub material_id: MaterialId,
    pub device_id: DeviceId,
    pub status: LicenseStatus,
    pub nonce: Nonce,
    pub issued_at: i64,
    pub last_validated_at: i64,
    pub expires_at: i64,
    pub offline_grace_period: Duration,
    pub revoked_at: Option<i64>,
}

impl License {
    /// Issue a new active license with a fresh nonce.
    pub fn issue(
        user_id: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        duration: Duration,
        offline_grace_period: Duration,
        now: i64,
    ) -> Self {
        Self {
            id: LicenseId::new(),
            user_id,
            material_id,
            device_id,
            status: LicenseStatus::Active,
            nonce: Nonce::generate(),
            issued_at: now,
            last_validated_at: now,
            expires_at: add_duration(now, duration),
            offline_grace_period,
            revoked_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LicenseStatus::Active && self.revoked_at.is_none()
    }

    pub fn is_revoked(&self) -> bool {
        !self.is_active()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Whether the device has been offline longer than the grace period.
    pub fn is_grace_exceeded(&self, now: i64) -> bool {
        now.saturating_sub(self.last_validated_at) > duration_millis(self.offline_grace_period)
    }

    /// Moment at which offline use stops being allowed without revalidation.
    pub fn offline_deadline(&self) -> i64 {
        add_duration(self.last_validated_at, self.offline_grace_period).min(self.expires_at)
    }

    /// Check the license against a device and a point in time, without the
    /// nonce.
    ///
    /// Order matters: revocation dominates, then binding, then expiry, then
    /// the offline grace window.
    pub fn check(&self, device_id: &DeviceId, now: i64) -> Result<(), LicenseViolation> {
        if self.is_revoked() {
            return Err(LicenseViolation::Revoked);
        }
        if self.device_id != *device_id {
            return Err(LicenseViolation::DeviceMismatch);
        }
        if self.is_expired(now) {
            return Err(LicenseViolation::Expired);
        }
        if self.is_grace_exceeded(now) {
            return Err(LicenseViolation::GracePeriodExceeded);
        }
        Ok(())
    }

    /// Full validation check including the single-use nonce.
    pub fn check_with_nonce(
        &self,
        device_id: &DeviceId,
        nonce: &Nonce,
        now: i64,
    ) -> Result<(), LicenseViolation> {
        self.check(device_id, now)?;
        if self.nonce != *nonce {
            return Err(LicenseViolation::InvalidNonce);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    fn license(now: i64) -> License {
        License::issue(
            UserId::new(),
            MaterialId::new(),
            DeviceId::new(),
            Duration::from_secs(30 * 24 * 3600),
            Duration::from_secs(72 * 3600),
            now,
        )
    }

    #[test]
    fn test_issue_sets_window() {
        let l = license(1_000);
        assert!(l.is_active());
        assert_eq!(l.expires_at, 1_000 + 30 * 24 * HOUR);
        assert_eq!(l.last_validated_at, 1_000);
        assert_eq!(l.offline_deadline(), 1_000 + 72 * HOUR);
    }

    #[test]
    fn test_check_order_revoked_dominates() {
        let mut l = license(0);
        l.status = LicenseStatus::Revoked;
        l.revoked_at = Some(1);
        let other = DeviceId::new();
        assert_eq!(l.check(&other, i64::MAX), Err(LicenseViolation::Revoked));
    }

    #[test]
    fn test_check_device_mismatch() {
        let l = license(0);
        assert_eq!(
            l.check(&DeviceId::new(), 1),
            Err(LicenseViolation::DeviceMismatch)
        );
    }

    #[test]
    fn test_grace_boundary_is_inclusive() {
        let l = license(0);
        assert!(l.check(&l.device_id, 72 * HOUR).is_ok());
        assert_eq!(
            l.check(&l.device_id, 72 * HOUR + 1),
            Err(LicenseViolation::GracePeriodExceeded)
        );
    }

    #[test]
    fn test_expiry_checked_before_grace() {
        let mut l = license(0);
        l.expires_at = 10;
        assert_eq!(l.check(&l.device_id, 11), Err(LicenseViolation::Expired));
    }

    #[test]
    fn test_nonce_must_match_exactly() {
        let l = license(0);
        let stale = Nonce::generate();
        assert_eq!(
            l.check_with_nonce(&l.device_id, &stale, 1),
            Err(LicenseViolation::InvalidNonce)
        );
        assert!(l.check_with_nonce(&l.device_id, &l.nonce.clone(), 1).is_ok());
    }
}

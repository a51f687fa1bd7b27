//! Devices: the hardware a license is bound to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::types::{DeviceId, Fingerprint, UserId};

/// Platform tag reported by the device client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Desktop,
}

impl Platform {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Desktop => "desktop",
        }
    }
}

impl FromStr for Platform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "desktop" => Ok(Platform::Desktop),
            other => Err(CoreError::InvalidPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device registered by a user.
///
/// Devices are never physically deleted; `revoked_at` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub user_id: UserId,
    pub fingerprint: Fingerprint,
    pub name: String,
    pub platform: Platform,
    pub registered_at: i64,
    pub last_used_at: i64,
    pub revoked_at: Option<i64>,
}

impl Device {
    /// Maximum display-name length in characters.
    pub const MAX_NAME_LEN: usize = 255;

    /// Create a new active device.
    pub fn new(
        user_id: UserId,
        fingerprint: Fingerprint,
        name: impl Into<String>,
        platform: Platform,
        now: i64,
    ) -> Result<Self, CoreError> {
        let name = name.into();
        let len = name.chars().count();
        if len == 0 || len > Self::MAX_NAME_LEN {
            return Err(CoreError::InvalidDeviceName { len });
        }

        Ok(Self {
            id: DeviceId::new(),
            user_id,
            fingerprint,
            name,
            platform,
            registered_at: now,
            last_used_at: now,
            revoked_at: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Whether this device is the one identified by `id` and `fingerprint`.
    pub fn matches(&self, id: &DeviceId, fingerprint: &Fingerprint) -> bool {
        self.id == *id && self.fingerprint == *fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp() -> Fingerprint {
        Fingerprint::new("f".repeat(40)).unwrap()
    }

    #[test]
    fn test_new_device_is_active() {
        let device = Device::new(UserId::new(), fp(), "Pixel", Platform::Android, 1_000).unwrap();
        assert!(device.is_active());
        assert_eq!(device.registered_at, 1_000);
        assert_eq!(device.last_used_at, 1_000);
    }

    #[test]
    fn test_device_name_bounds() {
        assert!(Device::new(UserId::new(), fp(), "", Platform::Ios, 0).is_err());
        assert!(Device::new(UserId::new(), fp(), "x".repeat(256), Platform::Ios, 0).is_err());
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("desktop".parse::<Platform>().unwrap(), Platform::Desktop);
        assert!(matches!(
            "windows".parse::<Platform>(),
            Err(CoreError::InvalidPlatform(_))
        ));
    }
}

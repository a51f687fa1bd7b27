//! Strong type definitions for Custodian.
//!
//! All identifiers are newtypes to prevent misuse at compile time: a
//! `DeviceId` can never be passed where a `LicenseId` is expected.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID.
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Parse from the hyphenated string form.
            pub fn parse(s: &str) -> Result<Self, CoreError> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| CoreError::InvalidId(format!("{}: {}", $label, s)))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identifier of a platform user (owned by the user service).
    UserId,
    "user"
);
define_id!(
    /// Identifier of a learning material (owned by the material service).
    MaterialId,
    "material"
);
define_id!(
    /// Identifier of a registered device.
    DeviceId,
    "device"
);
define_id!(
    /// Identifier of an offline license.
    LicenseId,
    "license"
);
define_id!(
    /// Identifier of a stored content encryption key.
    CekId,
    "cek"
);
define_id!(
    /// Identifier of an encryption job.
    JobId,
    "job"
);
define_id!(
    /// Identifier of an audit record.
    AuditId,
    "audit"
);

/// Opaque hash of a device's hardware/software identity.
///
/// Custodian never interprets the value; it only compares it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Minimum accepted length in characters.
    pub const MIN_LEN: usize = 32;
    /// Maximum accepted length in characters.
    pub const MAX_LEN: usize = 512;

    /// Create a fingerprint, enforcing the accepted length range.
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let fingerprint = Self(value.into());
        fingerprint.check()?;
        Ok(fingerprint)
    }

    /// Verify the accepted length range.
    pub fn check(&self) -> Result<(), CoreError> {
        let len = self.0.chars().count();
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&len) {
            return Err(CoreError::InvalidFingerprint { len });
        }
        Ok(())
    }

    /// Wrap a value without length checks.
    ///
    /// Used for values coming back from storage and for comparison inputs,
    /// where a malformed value simply fails to match.
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "Fingerprint({prefix}..)")
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Single-use token rotated on every successful license validation.
///
/// Encoded as 64 lowercase hex characters (32 random bytes).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    /// Number of random bytes behind a nonce.
    pub const BYTES: usize = 32;

    /// Generate a fresh nonce from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; Self::BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wrap a client-supplied or stored value.
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print a live nonce in full.
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "Nonce({prefix}..)")
    }
}

//! # Custodian Access
//!
//! Device binding and offline license control.
//!
//! ## Overview
//!
//! A user registers devices, each identified by an opaque fingerprint. A
//! license binds (user, material, device) for a fixed duration and carries a
//! single-use nonce that rotates on every successful validation. Between
//! validations a device may work offline for at most the license's grace
//! period.
//!
//! ## Key Types
//!
//! - [`DeviceRegistry`] - Register, list, touch and deregister devices
//! - [`LicenseManager`] - Issue, validate, renew and revoke licenses
//! - [`CekStore`] - Per-device wrapped content keys
//! - [`AbuseGuard`] - Per-device and per-material download limits and
//!   validation-failure blocking
//! - [`Notifier`] - Best-effort events and metrics
//! - [`AuditTrail`] - Best-effort security audit records
//!
//! ## Validation Order
//!
//! 1. Device blocked by the abuse guard
//! 2. License unknown
//! 3. License revoked
//! 4. Device id or fingerprint differs from the binding
//! 5. License expired
//! 6. Offline grace period exceeded
//! 7. Nonce differs from the stored nonce
//!
//! Failures from step 2 onward count towards the device's block threshold.
//!
//! ## Design Notes
//!
//! - **Computed expiry**: expiry and grace violations are derived from
//!   timestamps at validation time; there is no expiry sweep
//! - **Ports**: material entitlement ([`AccessChecker`]) and job creation
//!   ([`EncryptionRequester`]) are traits implemented elsewhere

pub mod audit;
pub mod error;
pub mod guard;
pub mod keys;
pub mod license;
pub mod notify;
pub mod ports;
pub mod registry;

pub use audit::AuditTrail;
pub use error::{AccessError, ErrorKind, Result};
pub use guard::{AbuseConfig, AbuseGuard, DownloadQuota};
pub use keys::{CekStore, RotationReport};
pub use license::{LicenseConfig, LicenseManager};
pub use notify::Notifier;
pub use ports::{AccessChecker, EncryptionRequester, KeyRewrap, PortError};
pub use registry::{DeviceConfig, DeviceRegistry};

//! # Custodian
//!
//! Offline access control and content protection for downloadable learning
//! material.
//!
//! ## Overview
//!
//! Custodian decides which device may hold which material offline, and for how
//! long:
//!
//! - **Devices**: each user registers a bounded number of fingerprinted devices
//! - **Licenses**: bind (user, material, device) with a rotating single-use nonce
//! - **Content keys**: one wrapped key per (user, material, device)
//! - **Encryption jobs**: produce the per-device encrypted copy in the background
//! - **Abuse guard**: rate-limits downloads per device and per material, and
//!   blocks devices that keep failing validation
//! - **Audit trail**: every security decision is recorded per user and device
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use custodian::{Custodian, CustodianConfig};
//! use custodian::core::{Fingerprint, MaterialId, Platform, UserId};
//! use custodian::jobs::{InMemorySource, SealingEngine};
//! use custodian::store::SqliteStore;
//! # use custodian::access::{AccessChecker, PortError};
//! # struct AllowAll;
//! # #[async_trait::async_trait]
//! # impl AccessChecker for AllowAll {
//! #     async fn check_access(&self, _: &UserId, _: &MaterialId) -> Result<bool, PortError> { Ok(true) }
//! # }
//!
//! async fn example() {
//!     let store = Arc::new(SqliteStore::open("custodian.db").unwrap());
//!     let engine = Arc::new(SealingEngine::new(Arc::new(InMemorySource::new()), store.clone()));
//!     let custodian = Custodian::new(store, Arc::new(AllowAll), engine, CustodianConfig::default());
//!     custodian.start_workers().unwrap();
//!
//!     let user = UserId::new();
//!     let fingerprint = Fingerprint::new("f".repeat(64)).unwrap();
//!     let device = custodian
//!         .register_device(user, fingerprint.clone(), "Reader", Platform::Android)
//!         .await
//!         .unwrap();
//!     let license = custodian
//!         .issue_license(user, MaterialId::new(), device.id, &fingerprint)
//!         .await
//!         .unwrap();
//!
//!     // Later, from the device:
//!     let next = custodian
//!         .validate_license(&license.id, &device.id, &fingerprint, &license.nonce)
//!         .await
//!         .unwrap();
//!     assert_ne!(next.nonce, license.nonce);
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `custodian::core` - Ids, entities, retry policy, event and metrics ports
//! - `custodian::store` - Repository traits, memory and SQLite backends
//! - `custodian::access` - Device registry, license manager, abuse guard
//! - `custodian::jobs` - Job service, worker pool, sealing engine

pub mod config;
pub mod custodian;
pub mod error;
pub mod telemetry;

pub use custodian_access as access;
pub use custodian_core as core;
pub use custodian_jobs as jobs;
pub use custodian_store as store;

pub use crate::config::CustodianConfig;
pub use crate::custodian::{Custodian, DownloadGrant};
pub use crate::error::{CustodianError, Result};
pub use crate::telemetry::init_tracing;

pub use custodian_access::{
    AccessChecker, DownloadQuota, KeyRewrap, Notifier, PortError, RotationReport,
};
pub use custodian_core::{
    AuditAction, AuditRecord, Device, DeviceId, EncryptionJob, EventPublisher, Fingerprint, JobId,
    JobStatus, License, LicenseId, MaterialId, MetricsSink, Nonce, Platform, UserId,
};

//! # Custodian Core
//!
//! Pure domain primitives for Custodian: devices, licenses, content encryption
//! keys and encryption jobs.
//!
//! This crate contains no I/O, no storage and no runtime. Every time-dependent
//! check takes `now` (Unix milliseconds) explicitly, so the rules can be tested
//! without a clock.
//!
//! ## Key Types
//!
//! - [`Device`] - A registered device, tombstoned on revocation
//! - [`License`] - A time-boxed, device-bound grant with a rotating [`Nonce`]
//! - [`ContentEncryptionKey`] - A per-device wrapped content key
//! - [`EncryptionJob`] - A unit of asynchronous encryption work
//! - [`RetryPolicy`] - Capped exponential backoff for failed jobs
//! - [`AuditRecord`] - One entry of the security audit trail
//!
//! ## Ports
//!
//! [`EventPublisher`] and [`MetricsSink`] are the observability seams. The
//! services publish named events and measurements through them and never depend
//! on a concrete backend.

pub mod audit;
pub mod cek;
pub mod device;
pub mod error;
pub mod events;
pub mod job;
pub mod license;
pub mod metrics;
pub mod retry;
pub mod time;
pub mod types;

pub use audit::{AuditAction, AuditRecord};
pub use cek::ContentEncryptionKey;
pub use device::{Device, Platform};
pub use error::CoreError;
pub use events::{Event, EventKind, EventPublisher, NoopPublisher, PublishError};
pub use job::{EncryptionJob, JobPriority, JobStatus};
pub use license::{License, LicenseStatus, LicenseViolation};
pub use metrics::{MetricsSink, NoopMetrics};
pub use retry::RetryPolicy;
pub use time::now_millis;
pub use types::{AuditId, CekId, DeviceId, Fingerprint, JobId, LicenseId, MaterialId, Nonce, UserId};

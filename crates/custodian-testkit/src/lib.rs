//! # Custodian Testkit
//!
//! Testing utilities for Custodian.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: deterministic fingerprints and hand-built entities
//! - **Doubles**: scripted access checker and engine, recording publisher and
//!   metrics sink
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Doubles
//!
//! ```rust
//! use std::sync::Arc;
//! use custodian_access::Notifier;
//! use custodian_testkit::{RecordingMetrics, RecordingPublisher};
//!
//! let events = Arc::new(RecordingPublisher::new());
//! let metrics = Arc::new(RecordingMetrics::new());
//! let notifier = Notifier::new(events.clone(), metrics.clone());
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use custodian_testkit::generators::{fingerprint, platform};
//!
//! proptest! {
//!     #[test]
//!     fn registration_accepts_valid_fingerprints(fp in fingerprint(), p in platform()) {
//!         // ...
//!     }
//! }
//! ```

pub mod doubles;
pub mod fixtures;
pub mod generators;

pub use doubles::{
    AccessMode, RecordingMetrics, RecordingPublisher, Script, ScriptedEngine, StaticAccess,
};
pub use fixtures::{fingerprint, multi_user_fixtures, random_fingerprint, TestFixture};
pub use generators::LicenseTimeline;

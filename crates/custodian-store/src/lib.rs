//! # Custodian Store
//!
//! Persistence contracts for Custodian. One async trait per entity, with SQLite
//! and in-memory implementations.
//!
//! ## Overview
//!
//! Services depend only on the repository traits, so the access and job layers
//! are storage-agnostic. The persistent implementation is [`SqliteStore`];
//! [`MemoryStore`] has identical semantics and is used in tests.
//!
//! ## Key Types
//!
//! - [`DeviceRepository`], [`LicenseRepository`], [`CekRepository`],
//!   [`JobRepository`], [`AuditRepository`] - The per-entity contracts
//! - [`Store`] - Any backend that implements all five
//! - [`DeviceInsert`] / [`LicenseInsert`] - Outcomes of guarded inserts
//! - [`JobCounts`] - Queue depth per job status
//!
//! ## Usage
//!
//! ```rust,no_run
//! use custodian_store::{DeviceRepository, SqliteStore};
//! use custodian_core::UserId;
//!
//! async fn example() {
//!     let store = SqliteStore::open("custodian.db").unwrap();
//!     let devices = store.list_active_devices(&UserId::new()).await.unwrap();
//!     assert!(devices.is_empty());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Guarded inserts**: device cap, duplicate fingerprints and the
//!   single-active-license rule are checked inside the insert
//! - **Compare-and-swap**: nonce rotation only succeeds against the expected nonce
//! - **Exclusive claims**: a pending job can be claimed by exactly one worker
//! - **Bound key writes**: a content key is stored on behalf of a license only
//!   while that license and its device are active
//! - **Tombstones**: devices and licenses are revoked, never deleted

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    AuditRepository, CekRepository, DeviceInsert, DeviceRepository, JobCounts, JobRepository,
    LicenseInsert, LicenseRepository, Store,
};

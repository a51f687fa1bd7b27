//! # Custodian Jobs
//!
//! Background production of per-device encrypted material.
//!
//! ## Overview
//!
//! Issuing a license enqueues an encryption job through the [`JobService`].
//! The [`WorkerPool`] claims pending jobs, runs them through an
//! [`EncryptionEngine`], and stores the resulting wrapped content key.
//! Failed jobs are retried with capped exponential backoff until the retry
//! budget is spent, then marked failed with the engine's error text.
//!
//! ## Job Lifecycle
//!
//! ```text
//!            claim               success
//! Pending ----------> Processing ---------> Completed
//!    ^                   |
//!    |  backoff, release | failure, retries left
//!    +-------------------+
//!                        | failure, out of retries
//!                        +----------------> Failed
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use custodian_access::{CekStore, Notifier};
//! use custodian_core::RetryPolicy;
//! use custodian_jobs::{InMemorySource, SealingEngine, WorkerConfig, WorkerPool};
//! use custodian_store::MemoryStore;
//!
//! async fn example() {
//!     let store = Arc::new(MemoryStore::new());
//!     let engine = Arc::new(SealingEngine::new(Arc::new(InMemorySource::new()), store.clone()));
//!     let keys = CekStore::new(store.clone(), Notifier::noop());
//!
//!     let pool = WorkerPool::new(
//!         store,
//!         engine,
//!         keys,
//!         RetryPolicy::default(),
//!         WorkerConfig::default(),
//!         Notifier::noop(),
//!     );
//!     pool.start().unwrap();
//!     // ...
//!     pool.stop().await;
//! }
//! ```

pub mod engine;
pub mod error;
pub mod sealing;
pub mod service;
pub mod worker;

pub use engine::{EncryptionEngine, EncryptionOutput, EncryptionRequest, EngineError};
pub use error::{JobError, Result};
pub use sealing::{open_artifact, unwrap_key, InMemorySource, MaterialSource, SealingEngine};
pub use service::JobService;
pub use worker::{WorkerConfig, WorkerPool};

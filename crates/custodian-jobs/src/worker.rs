//! Worker pool: executes pending encryption jobs.
//!
//! `concurrency` independent units poll the job repository. A unit claims each
//! job with an atomic Pending -> Processing transition, so two units never run
//! the same job. Shutdown is a `watch` channel observed by every wait; a job
//! already inside the engine is allowed to finish within `shutdown_timeout`.
//!
//! The produced key is stored only if the job's license and device are still
//! active at write time. A job whose binding was revoked mid-run fails
//! without retry.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use custodian_access::{CekStore, Notifier};
use custodian_core::{now_millis, EncryptionJob, EventKind, RetryPolicy};
use custodian_store::JobRepository;

use crate::engine::{EncryptionEngine, EncryptionRequest};
use crate::error::{JobError, Result};

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of independent worker units.
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Pending jobs fetched per poll.
    pub batch_size: usize,
    /// Upper bound on a single engine run.
    pub job_timeout: Duration,
    /// How long `stop` waits for units to finish.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            job_timeout: Duration::from_secs(30 * 60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

enum PoolState {
    Stopped,
    Running {
        cancel: watch::Sender<bool>,
        units: Vec<JoinHandle<()>>,
    },
    Stopping,
}

/// Runs encryption jobs in the background.
pub struct WorkerPool {
    worker: Arc<Worker>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        engine: Arc<dyn EncryptionEngine>,
        keys: CekStore,
        retry: RetryPolicy,
        config: WorkerConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                jobs,
                engine,
                keys,
                retry,
                config,
                notifier,
            }),
            state: Mutex::new(PoolState::Stopped),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.worker.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the worker units. Must be called inside a tokio runtime.
    ///
    /// Fails with `AlreadyRunning` unless the pool is stopped.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if !matches!(*state, PoolState::Stopped) {
            return Err(JobError::AlreadyRunning);
        }

        let (cancel, rx) = watch::channel(false);
        let concurrency = self.worker.config.concurrency.max(1);
        let units = (0..concurrency)
            .map(|unit| tokio::spawn(self.worker.clone().run(unit, rx.clone())))
            .collect();

        tracing::info!(
            concurrency,
            poll_interval_ms = self.worker.config.poll_interval.as_millis() as u64,
            "worker pool started"
        );
        *state = PoolState::Running { cancel, units };
        Ok(())
    }

    /// Signal every unit to stop and wait up to `shutdown_timeout`.
    ///
    /// Units still busy after the timeout are detached; they exit on their own
    /// once their current job ends. No-op unless running.
    pub async fn stop(&self) {
        let (cancel, units) = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, PoolState::Stopping) {
                PoolState::Running { cancel, units } => (cancel, units),
                other => {
                    *state = other;
                    return;
                }
            }
        };

        tracing::info!("stopping worker pool");
        let _ = cancel.send(true);

        let timeout = self.worker.config.shutdown_timeout;
        let joined = tokio::time::timeout(timeout, async {
            for unit in units {
                if let Err(e) = unit.await {
                    tracing::error!(error = %e, "worker unit panicked");
                }
            }
        })
        .await;

        match joined {
            Ok(()) => tracing::info!("worker pool stopped"),
            Err(_) => tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "worker pool shutdown timed out, detaching busy units"
            ),
        }
        *self.lock() = PoolState::Stopped;
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), PoolState::Running { .. })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let PoolState::Running { cancel, .. } = &*self.lock() {
            let _ = cancel.send(true);
        }
    }
}

struct Worker {
    jobs: Arc<dyn JobRepository>,
    engine: Arc<dyn EncryptionEngine>,
    keys: CekStore,
    retry: RetryPolicy,
    config: WorkerConfig,
    notifier: Notifier,
}

/// Resolve once shutdown is signalled (or the pool is gone).
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

impl Worker {
    async fn run(self: Arc<Self>, unit: usize, mut cancel: watch::Receiver<bool>) {
        tracing::debug!(unit, "worker unit started");
        loop {
            if *cancel.borrow() {
                break;
            }
            self.poll(unit, &mut cancel).await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancelled(&mut cancel) => break,
            }
        }
        tracing::debug!(unit, "worker unit exited");
    }

    async fn poll(&self, unit: usize, cancel: &mut watch::Receiver<bool>) {
        let pending = match self.jobs.list_pending(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(unit, error = %e, "failed to list pending jobs");
                return;
            }
        };
        if !pending.is_empty() {
            tracing::debug!(unit, count = pending.len(), "pending jobs fetched");
        }

        for job in pending {
            if *cancel.borrow() {
                return;
            }
            match self.jobs.claim_job(&job.id, now_millis()).await {
                Ok(Some(claimed)) => self.process(unit, claimed, cancel).await,
                Ok(None) => tracing::trace!(unit, job_id = %job.id, "job claimed elsewhere"),
                Err(e) => tracing::warn!(unit, job_id = %job.id, error = %e, "failed to claim job"),
            }
        }
    }

    async fn process(&self, unit: usize, job: EncryptionJob, cancel: &mut watch::Receiver<bool>) {
        tracing::info!(
            unit,
            job_id = %job.id,
            material_id = %job.material_id,
            attempt = job.retry_count + 1,
            "processing encryption job"
        );
        let started = Instant::now();
        let outcome = self.execute(&job).await;
        self.notifier.observe("jobs.duration", started.elapsed());

        match outcome {
            Ok(()) => self.complete(&job).await,
            Err(e) => self.handle_failure(&job, e, cancel).await,
        }
    }

    async fn execute(&self, job: &EncryptionJob) -> Result<()> {
        let request = EncryptionRequest::from(job);
        let output = tokio::time::timeout(self.config.job_timeout, self.engine.encrypt(&request))
            .await
            .map_err(|_| JobError::Timeout(self.config.job_timeout))??;

        let stored = self
            .keys
            .store_licensed_key(
                &job.license_id,
                job.user_id,
                job.material_id,
                job.device_id,
                output.wrapped_key,
                now_millis(),
            )
            .await?;
        match stored {
            Some(_) => Ok(()),
            None => Err(JobError::BindingRevoked(job.license_id)),
        }
    }

    async fn complete(&self, job: &EncryptionJob) {
        let now = now_millis();
        match self.jobs.complete_job(&job.id, now).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "job was no longer processing at completion");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to mark job completed");
                return;
            }
        }

        tracing::info!(job_id = %job.id, material_id = %job.material_id, "encryption job completed");
        self.notifier.increment("jobs.completed");
        self.notifier
            .publish(EventKind::EncryptionCompleted, job_payload(job, None), now);
    }

    async fn handle_failure(
        &self,
        job: &EncryptionJob,
        error: JobError,
        cancel: &mut watch::Receiver<bool>,
    ) {
        let message = error.to_string();
        if error.is_retryable() {
            match self
                .jobs
                .retry_job(&job.id, &message, self.retry.max_retries)
                .await
            {
                Ok(Some(retry_count)) => {
                    self.back_off(job, retry_count, &message, cancel).await;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "failed to record job failure");
                    return;
                }
            }
        }
        self.fail(job, &message).await;
    }

    async fn back_off(
        &self,
        job: &EncryptionJob,
        retry_count: u32,
        message: &str,
        cancel: &mut watch::Receiver<bool>,
    ) {
        let delay = self.retry.delay_for(job.retry_count);
        tracing::warn!(
            job_id = %job.id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "encryption job failed, will retry"
        );
        self.notifier.increment("jobs.retried");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(cancel) => {
                tracing::debug!(job_id = %job.id, "shutdown during backoff, releasing job");
            }
        }
        if let Err(e) = self.jobs.release_job(&job.id).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to release job for retry");
        }
    }

    async fn fail(&self, job: &EncryptionJob, message: &str) {
        let now = now_millis();
        match self.jobs.fail_job(&job.id, message, now).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "job was no longer processing at failure");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to mark job failed");
                return;
            }
        }

        tracing::error!(
            job_id = %job.id,
            retry_count = job.retry_count,
            error = %message,
            "encryption job failed permanently"
        );
        self.notifier.increment("jobs.failed");
        self.notifier.publish(
            EventKind::EncryptionFailed,
            job_payload(job, Some(message)),
            now,
        );
    }
}

fn job_payload(job: &EncryptionJob, error: Option<&str>) -> serde_json::Value {
    json!({
        "job_id": job.id,
        "material_id": job.material_id,
        "user_id": job.user_id,
        "device_id": job.device_id,
        "license_id": job.license_id,
        "error": error,
    })
}

//! Aggregated configuration.
//!
//! Every field is optional; missing fields take the component defaults.
//! Durations are milliseconds.
//!
//! ```json
//! {
//!   "license_duration_ms": 2592000000,
//!   "max_devices_per_user": 3,
//!   "worker_concurrency": 4
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

use custodian_access::{AbuseConfig, DeviceConfig, LicenseConfig};
use custodian_core::{JobPriority, RetryPolicy};
use custodian_jobs::WorkerConfig;

const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CustodianConfig {
    // Devices
    pub max_devices_per_user: Option<usize>,

    // Licenses
    pub license_duration_ms: Option<u64>,
    pub offline_grace_period_ms: Option<u64>,
    /// Raw priority of jobs requested on issue (1 = high, 2 = normal, 3 = low).
    pub job_priority: Option<i64>,

    // Abuse guard
    pub max_downloads_per_window: Option<u32>,
    /// Downloads of one material across all devices per window.
    pub max_downloads_per_material_window: Option<u32>,
    pub max_validation_failures_per_window: Option<u32>,
    pub abuse_window_ms: Option<u64>,
    pub block_duration_ms: Option<u64>,

    // Retries
    pub max_job_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,

    // Workers
    pub worker_concurrency: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub job_timeout_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
    /// Completed jobs older than this are removed by `cleanup_jobs`.
    pub job_retention_ms: Option<u64>,
}

fn ms(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl CustodianConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid custodian config")?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("in config file {}", path.display()))
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.max_devices_per_user != Some(0),
            "max_devices_per_user must be at least 1"
        );
        ensure!(
            self.worker_concurrency != Some(0),
            "worker_concurrency must be at least 1"
        );
        ensure!(self.batch_size != Some(0), "batch_size must be at least 1");
        ensure!(
            self.max_downloads_per_window != Some(0),
            "max_downloads_per_window must be at least 1"
        );
        ensure!(
            self.max_downloads_per_material_window != Some(0),
            "max_downloads_per_material_window must be at least 1"
        );
        ensure!(
            self.max_validation_failures_per_window != Some(0),
            "max_validation_failures_per_window must be at least 1"
        );
        ensure!(
            self.poll_interval_ms != Some(0),
            "poll_interval_ms must be positive"
        );

        let retry = self.retry_policy();
        ensure!(
            retry.base_delay <= retry.max_delay,
            "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
            retry.base_delay.as_millis(),
            retry.max_delay.as_millis()
        );
        Ok(())
    }

    pub fn device_config(&self) -> DeviceConfig {
        let default = DeviceConfig::default();
        DeviceConfig {
            max_devices_per_user: self
                .max_devices_per_user
                .unwrap_or(default.max_devices_per_user),
        }
    }

    pub fn license_config(&self) -> LicenseConfig {
        let default = LicenseConfig::default();
        LicenseConfig {
            license_duration: ms(self.license_duration_ms, default.license_duration),
            offline_grace_period: ms(self.offline_grace_period_ms, default.offline_grace_period),
            job_priority: self
                .job_priority
                .map(JobPriority::from_raw)
                .unwrap_or(default.job_priority),
        }
    }

    pub fn abuse_config(&self) -> AbuseConfig {
        let default = AbuseConfig::default();
        AbuseConfig {
            max_downloads_per_window: self
                .max_downloads_per_window
                .unwrap_or(default.max_downloads_per_window),
            max_downloads_per_material_window: self
                .max_downloads_per_material_window
                .unwrap_or(default.max_downloads_per_material_window),
            max_validation_failures_per_window: self
                .max_validation_failures_per_window
                .unwrap_or(default.max_validation_failures_per_window),
            window: ms(self.abuse_window_ms, default.window),
            block_duration: ms(self.block_duration_ms, default.block_duration),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let default = RetryPolicy::default();
        RetryPolicy {
            base_delay: ms(self.retry_base_delay_ms, default.base_delay),
            max_delay: ms(self.retry_max_delay_ms, default.max_delay),
            max_retries: self.max_job_retries.unwrap_or(default.max_retries),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let default = WorkerConfig::default();
        WorkerConfig {
            concurrency: self.worker_concurrency.unwrap_or(default.concurrency),
            poll_interval: ms(self.poll_interval_ms, default.poll_interval),
            batch_size: self.batch_size.unwrap_or(default.batch_size),
            job_timeout: ms(self.job_timeout_ms, default.job_timeout),
            shutdown_timeout: ms(self.shutdown_timeout_ms, default.shutdown_timeout),
        }
    }

    pub fn job_retention(&self) -> Duration {
        ms(self.job_retention_ms, DEFAULT_JOB_RETENTION)
    }
}

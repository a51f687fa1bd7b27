//! Job service: creation, lookup and housekeeping of encryption jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use custodian_access::{EncryptionRequester, Notifier, PortError};
use custodian_core::time::duration_millis;
use custodian_core::{
    DeviceId, EncryptionJob, EventKind, JobId, JobPriority, License, LicenseId, MaterialId,
    RetryPolicy, UserId,
};
use custodian_store::{JobCounts, JobRepository};

use crate::error::{JobError, Result};

pub struct JobService {
    jobs: Arc<dyn JobRepository>,
    retry: RetryPolicy,
    notifier: Notifier,
}

impl JobService {
    pub fn new(jobs: Arc<dyn JobRepository>, retry: RetryPolicy, notifier: Notifier) -> Self {
        Self {
            jobs,
            retry,
            notifier,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Persist a Pending job.
    ///
    /// `priority` is the raw scheduling value (1 = high, 2 = normal, 3 = low);
    /// anything else becomes normal.
    pub async fn create_job(
        &self,
        material_id: MaterialId,
        user_id: UserId,
        device_id: DeviceId,
        license_id: LicenseId,
        priority: i64,
        now: i64,
    ) -> Result<EncryptionJob> {
        let priority = JobPriority::from_raw(priority);
        let job = EncryptionJob::new(material_id, user_id, device_id, license_id, priority, now);
        self.jobs.insert_job(&job).await?;

        tracing::info!(
            job_id = %job.id,
            material_id = %material_id,
            priority = priority.as_raw(),
            "encryption job created"
        );
        self.notifier.increment("jobs.created");
        self.notifier.publish(
            EventKind::EncryptionRequested,
            json!({
                "job_id": job.id,
                "material_id": material_id,
                "user_id": user_id,
                "device_id": device_id,
                "license_id": license_id,
                "priority": priority,
            }),
            now,
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<EncryptionJob> {
        self.jobs.get_job(id).await?.ok_or(JobError::JobNotFound)
    }

    /// Newest job for a material.
    pub async fn get_job_by_material(&self, material_id: &MaterialId) -> Result<EncryptionJob> {
        self.jobs
            .latest_job_for_material(material_id)
            .await?
            .ok_or(JobError::JobNotFound)
    }

    /// Newest job for a license.
    pub async fn get_job_by_license(&self, license_id: &LicenseId) -> Result<EncryptionJob> {
        self.jobs
            .latest_job_for_license(license_id)
            .await?
            .ok_or(JobError::JobNotFound)
    }

    /// Backoff before the next attempt of a job that has failed `retry_count`
    /// times.
    pub fn calculate_retry_delay(&self, retry_count: u32) -> Duration {
        self.retry.delay_for(retry_count)
    }

    /// Delete Completed jobs that finished more than `older_than` before `now`.
    pub async fn cleanup_old_jobs(&self, older_than: Duration, now: i64) -> Result<u64> {
        let cutoff = now.saturating_sub(duration_millis(older_than));
        let removed = self.jobs.delete_completed_before(cutoff).await?;
        tracing::info!(removed, cutoff, "old encryption jobs cleaned up");
        Ok(removed)
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        Ok(self.jobs.job_counts().await?)
    }
}

#[async_trait]
impl EncryptionRequester for JobService {
    async fn request_encryption(
        &self,
        license: &License,
        priority: JobPriority,
        now: i64,
    ) -> std::result::Result<JobId, PortError> {
        self.create_job(
            license.material_id,
            license.user_id,
            license.device_id,
            license.id,
            priority.as_raw(),
            now,
        )
        .await
        .map(|job| job.id)
        .map_err(|e| PortError::new(e.to_string()))
    }
}

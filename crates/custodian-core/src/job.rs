//! Encryption jobs.
//!
//! A job asks the worker pool to produce a per-device encrypted copy of a
//! material. Status moves Pending -> Processing -> {Completed, Failed}, with
//! Processing -> Pending on a retry. Completed and Failed are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::types::{DeviceId, JobId, LicenseId, MaterialId, UserId};

/// Scheduling hint. Lower raw value sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    /// Map a raw priority (1 = high, 2 = normal, 3 = low).
    ///
    /// Anything outside 1..=3 is clamped to `Normal`.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            1 => JobPriority::High,
            3 => JobPriority::Low,
            _ => JobPriority::Normal,
        }
    }

    pub const fn as_raw(&self) -> i64 {
        match self {
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::UnknownEnumValue {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionJob {
    pub id: JobId,
    pub material_id: MaterialId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub license_id: LicenseId,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub retry_count: u32,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
}

impl EncryptionJob {
    /// Create a pending job.
    pub fn new(
        material_id: MaterialId,
        user_id: UserId,
        device_id: DeviceId,
        license_id: LicenseId,
        priority: JobPriority,
        now: i64,
    ) -> Self {
        Self {
            id: JobId::new(),
            material_id,
            user_id,
            device_id,
            license_id,
            priority,
            status: JobStatus::Pending,
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Whether another attempt is allowed under `max_retries`.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the retention sweep may delete this job.
    pub fn is_purgeable(&self, cutoff: i64) -> bool {
        self.status == JobStatus::Completed
            && self.completed_at.map(|at| at < cutoff).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> EncryptionJob {
        EncryptionJob::new(
            MaterialId::new(),
            UserId::new(),
            DeviceId::new(),
            LicenseId::new(),
            JobPriority::Normal,
            0,
        )
    }

    #[test]
    fn test_priority_clamps_out_of_range() {
        assert_eq!(JobPriority::from_raw(1), JobPriority::High);
        assert_eq!(JobPriority::from_raw(3), JobPriority::Low);
        assert_eq!(JobPriority::from_raw(0), JobPriority::Normal);
        assert_eq!(JobPriority::from_raw(7), JobPriority::Normal);
        assert_eq!(JobPriority::from_raw(-1), JobPriority::Normal);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::High < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::Low);
    }

    #[test]
    fn test_can_retry_stops_at_max() {
        let mut j = job();
        for _ in 0..3 {
            assert!(j.can_retry(3));
            j.retry_count += 1;
        }
        assert!(!j.can_retry(3));
    }

    #[test]
    fn test_only_old_completed_jobs_are_purgeable() {
        let mut j = job();
        assert!(!j.is_purgeable(100));

        j.status = JobStatus::Processing;
        assert!(!j.is_purgeable(100));

        j.status = JobStatus::Failed;
        j.completed_at = Some(10);
        assert!(!j.is_purgeable(100));

        j.status = JobStatus::Completed;
        assert!(j.is_purgeable(100));
        assert!(!j.is_purgeable(10));
    }
}

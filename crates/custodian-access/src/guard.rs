//! Abuse guard: per-device and per-material counters.
//!
//! Each device has two independent fixed windows, one for downloads and one
//! for validation failures. Each material has its own download window shared
//! by all devices. A window opens with the first event and resets once
//! `window` has elapsed. Reaching the failure cap blocks the device for
//! `block_duration`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use custodian_core::time::{add_duration, duration_millis};
use custodian_core::{AuditAction, AuditRecord, DeviceId, MaterialId};

use crate::audit::AuditTrail;
use crate::error::{AccessError, Result};

/// Abuse guard limits.
#[derive(Debug, Clone)]
pub struct AbuseConfig {
    pub max_downloads_per_window: u32,
    pub max_downloads_per_material_window: u32,
    pub max_validation_failures_per_window: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            max_downloads_per_window: 10,
            max_downloads_per_material_window: 100,
            max_validation_failures_per_window: 5,
            window: Duration::from_secs(3600),
            block_duration: Duration::from_secs(3600),
        }
    }
}

/// Remaining download allowance for a device or a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadQuota {
    pub limit: u32,
    pub remaining: u32,
    /// When the current window closes; `None` if no window is open.
    pub resets_at: Option<i64>,
}

impl DownloadQuota {
    fn of(slot: &mut Option<Window>, limit: u32, now: i64, len: Duration) -> Self {
        match live(slot, now, len) {
            Some(w) => Self {
                limit,
                remaining: limit.saturating_sub(w.count),
                resets_at: Some(w.ends_at(len)),
            },
            None => Self {
                limit,
                remaining: limit,
                resets_at: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: i64,
    count: u32,
}

impl Window {
    fn ends_at(&self, len: Duration) -> i64 {
        add_duration(self.started_at, len)
    }
}

/// Return the live window, dropping it if it has elapsed.
fn live(slot: &mut Option<Window>, now: i64, len: Duration) -> Option<&mut Window> {
    if matches!(slot, Some(w) if now >= w.ends_at(len)) {
        *slot = None;
    }
    slot.as_mut()
}

fn bump(slot: &mut Option<Window>, now: i64, len: Duration) -> u32 {
    if let Some(w) = live(slot, now, len) {
        w.count += 1;
        return w.count;
    }
    *slot = Some(Window {
        started_at: now,
        count: 1,
    });
    1
}

fn until(at: i64, now: i64) -> Duration {
    Duration::from_millis(at.saturating_sub(now).max(0) as u64)
}

/// Time left in the window if it has reached `cap`.
fn exhausted(slot: &mut Option<Window>, cap: u32, now: i64, len: Duration) -> Option<Duration> {
    live(slot, now, len)
        .filter(|w| w.count >= cap)
        .map(|w| until(w.ends_at(len), now))
}

#[derive(Debug, Default)]
struct DeviceCounters {
    downloads: Option<Window>,
    failures: Option<Window>,
    blocked_until: Option<i64>,
}

#[derive(Debug, Default)]
struct Counters {
    devices: HashMap<DeviceId, DeviceCounters>,
    materials: HashMap<MaterialId, Option<Window>>,
}

/// Tracks abuse counters in memory.
pub struct AbuseGuard {
    config: AbuseConfig,
    counters: Mutex<Counters>,
    audit: AuditTrail,
}

impl AbuseGuard {
    pub fn new(config: AbuseConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters::default()),
            audit: AuditTrail::disabled(),
        }
    }

    /// Record device blocks in an audit trail.
    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &AbuseConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters stay usable even if a holder panicked.
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail with `DeviceBlocked` while a block is in force.
    pub fn check_not_blocked(&self, device_id: &DeviceId, now: i64) -> Result<()> {
        let mut counters = self.lock();
        let Some(device) = counters.devices.get_mut(device_id) else {
            return Ok(());
        };
        match device.blocked_until {
            Some(until_at) if now < until_at => Err(AccessError::DeviceBlocked {
                retry_after: until(until_at, now),
            }),
            Some(_) => {
                device.blocked_until = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_blocked(&self, device_id: &DeviceId, now: i64) -> bool {
        self.check_not_blocked(device_id, now).is_err()
    }

    /// Record a failed validation. Returns true if this failure blocked the
    /// device.
    pub async fn record_validation_failure(&self, device_id: &DeviceId, now: i64) -> bool {
        let blocked = self.count_failure(device_id, now);
        if blocked {
            self.audit
                .record(
                    AuditRecord::failure(AuditAction::DeviceBlock, *device_id, "too_many_failures", now)
                        .on_device(*device_id),
                )
                .await;
        }
        blocked
    }

    fn count_failure(&self, device_id: &DeviceId, now: i64) -> bool {
        let mut counters = self.lock();
        let device = counters.devices.entry(*device_id).or_default();
        let count = bump(&mut device.failures, now, self.config.window);

        let already_blocked = matches!(device.blocked_until, Some(at) if now < at);
        if count >= self.config.max_validation_failures_per_window && !already_blocked {
            device.blocked_until = Some(add_duration(now, self.config.block_duration));
            tracing::warn!(
                device_id = %device_id,
                failures = count,
                block_ms = duration_millis(self.config.block_duration),
                "device blocked after repeated validation failures"
            );
            return true;
        }
        false
    }

    /// Fail if either the device's or the material's download window is
    /// exhausted, without consuming quota.
    pub fn ensure_download_allowed(
        &self,
        device_id: &DeviceId,
        material_id: &MaterialId,
        now: i64,
    ) -> Result<()> {
        let mut counters = self.lock();
        self.refuse_if_exhausted(&mut counters, device_id, material_id, now)
    }

    /// Count a download against both the device and the material. Fails with
    /// `RateLimitExceeded` or `MaterialRateLimitExceeded` once either cap is
    /// reached, in which case neither counter moves.
    ///
    /// Returns the device's remaining quota.
    pub fn record_download(
        &self,
        device_id: &DeviceId,
        material_id: &MaterialId,
        now: i64,
    ) -> Result<DownloadQuota> {
        let window = self.config.window;
        let mut counters = self.lock();
        self.refuse_if_exhausted(&mut counters, device_id, material_id, now)?;

        let material = counters.materials.entry(*material_id).or_default();
        bump(material, now, window);

        let device = counters.devices.entry(*device_id).or_default();
        bump(&mut device.downloads, now, window);
        Ok(DownloadQuota::of(
            &mut device.downloads,
            self.config.max_downloads_per_window,
            now,
            window,
        ))
    }

    pub fn download_quota(&self, device_id: &DeviceId, now: i64) -> DownloadQuota {
        let limit = self.config.max_downloads_per_window;
        let mut counters = self.lock();
        match counters.devices.get_mut(device_id) {
            Some(device) => DownloadQuota::of(&mut device.downloads, limit, now, self.config.window),
            None => DownloadQuota::of(&mut None, limit, now, self.config.window),
        }
    }

    /// Remaining downloads of a material across all devices.
    pub fn material_quota(&self, material_id: &MaterialId, now: i64) -> DownloadQuota {
        let limit = self.config.max_downloads_per_material_window;
        let mut counters = self.lock();
        match counters.materials.get_mut(material_id) {
            Some(slot) => DownloadQuota::of(slot, limit, now, self.config.window),
            None => DownloadQuota::of(&mut None, limit, now, self.config.window),
        }
    }

    /// Clear the block and the failure window for a device.
    pub fn unblock(&self, device_id: &DeviceId) {
        if let Some(device) = self.lock().devices.get_mut(device_id) {
            device.blocked_until = None;
            device.failures = None;
            tracing::info!(device_id = %device_id, "device unblocked");
        }
    }

    fn refuse_if_exhausted(
        &self,
        counters: &mut Counters,
        device_id: &DeviceId,
        material_id: &MaterialId,
        now: i64,
    ) -> Result<()> {
        let window = self.config.window;
        if let Some(device) = counters.devices.get_mut(device_id) {
            let cap = self.config.max_downloads_per_window;
            if let Some(retry_after) = exhausted(&mut device.downloads, cap, now, window) {
                return Err(AccessError::RateLimitExceeded { retry_after });
            }
        }
        if let Some(slot) = counters.materials.get_mut(material_id) {
            let cap = self.config.max_downloads_per_material_window;
            if let Some(retry_after) = exhausted(slot, cap, now, window) {
                tracing::warn!(material_id = %material_id, "material download limit reached");
                return Err(AccessError::MaterialRateLimitExceeded { retry_after });
            }
        }
        Ok(())
    }
}

impl Default for AbuseGuard {
    fn default() -> Self {
        Self::new(AbuseConfig::default())
    }
}

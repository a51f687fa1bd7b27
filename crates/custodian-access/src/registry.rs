//! Device registry.

use std::sync::Arc;

use serde_json::json;

use custodian_core::{
    AuditAction, AuditRecord, Device, DeviceId, EventKind, Fingerprint, Platform, UserId,
};
use custodian_store::{DeviceInsert, DeviceRepository};

use crate::audit::AuditTrail;
use crate::error::{AccessError, Result};
use crate::keys::CekStore;
use crate::license::LicenseManager;
use crate::notify::Notifier;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub max_devices_per_user: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_devices_per_user: 5,
        }
    }
}

/// Owns device identity per user.
///
/// Deregistration cascades: every license bound to the device is revoked and
/// every content key wrapped for it is deleted.
pub struct DeviceRegistry {
    devices: Arc<dyn DeviceRepository>,
    licenses: Arc<LicenseManager>,
    keys: CekStore,
    config: DeviceConfig,
    notifier: Notifier,
    audit: AuditTrail,
}

impl DeviceRegistry {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        licenses: Arc<LicenseManager>,
        keys: CekStore,
        config: DeviceConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            devices,
            licenses,
            keys,
            config,
            notifier,
            audit: AuditTrail::disabled(),
        }
    }

    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = audit;
        self
    }

    pub async fn register(
        &self,
        user_id: UserId,
        fingerprint: Fingerprint,
        name: &str,
        platform: Platform,
        now: i64,
    ) -> Result<Device> {
        fingerprint.check()?;
        let device = Device::new(user_id, fingerprint, name, platform, now)?;

        let refused = match self
            .devices
            .register_device(&device, self.config.max_devices_per_user)
            .await?
        {
            DeviceInsert::Inserted => None,
            DeviceInsert::Duplicate { existing } => {
                tracing::debug!(user_id = %user_id, existing = %existing, "duplicate device registration");
                Some(AccessError::DuplicateDevice)
            }
            DeviceInsert::LimitReached { active } => {
                tracing::info!(user_id = %user_id, active, "device limit reached");
                Some(AccessError::DeviceLimitExceeded {
                    max: self.config.max_devices_per_user,
                })
            }
        };
        if let Some(err) = refused {
            self.audit
                .record(
                    AuditRecord::failure(AuditAction::DeviceRegister, device.id, err.code(), now)
                        .by_user(user_id),
                )
                .await;
            return Err(err);
        }
        self.audit
            .record(
                AuditRecord::success(AuditAction::DeviceRegister, device.id, now)
                    .by_user(user_id)
                    .on_device(device.id),
            )
            .await;

        tracing::info!(
            device_id = %device.id,
            user_id = %user_id,
            platform = %device.platform,
            "device registered"
        );
        self.notifier.increment("device.registered");
        self.notifier.publish(
            EventKind::DeviceRegistered,
            json!({
                "device_id": device.id,
                "user_id": user_id,
                "platform": device.platform,
            }),
            now,
        );
        Ok(device)
    }

    /// Active devices of a user.
    pub async fn list(&self, user_id: &UserId) -> Result<Vec<Device>> {
        Ok(self.devices.list_active_devices(user_id).await?)
    }

    /// A device owned by `user_id`, revoked or not.
    pub async fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Device> {
        self.devices
            .get_device(device_id)
            .await?
            .filter(|d| d.user_id == *user_id)
            .ok_or(AccessError::DeviceNotRegistered)
    }

    pub async fn touch(&self, device_id: &DeviceId, now: i64) -> Result<()> {
        if self.devices.touch_device(device_id, now).await? {
            Ok(())
        } else {
            Err(AccessError::DeviceNotRegistered)
        }
    }

    /// Revoke a device and everything bound to it.
    pub async fn deregister(&self, user_id: &UserId, device_id: &DeviceId, now: i64) -> Result<()> {
        let device = self.get(user_id, device_id).await?;
        if device.is_revoked() || !self.devices.revoke_device(device_id, now).await? {
            return Err(AccessError::DeviceNotRegistered);
        }

        let revoked = match self.licenses.revoke_by_device(device_id, now).await {
            Ok(ids) => ids.len(),
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "failed to revoke licenses for device");
                0
            }
        };
        let deleted = match self.keys.delete_for_device(device_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "failed to delete content keys for device");
                0
            }
        };

        self.audit
            .record(
                AuditRecord::success(AuditAction::DeviceDeregister, *device_id, now)
                    .by_user(*user_id)
                    .on_device(*device_id),
            )
            .await;
        tracing::info!(
            device_id = %device_id,
            user_id = %user_id,
            licenses_revoked = revoked,
            keys_deleted = deleted,
            "device deregistered"
        );
        self.notifier.increment("device.deregistered");
        self.notifier.publish(
            EventKind::DeviceDeregistered,
            json!({
                "device_id": device_id,
                "user_id": user_id,
                "licenses_revoked": revoked,
                "keys_deleted": deleted,
            }),
            now,
        );
        Ok(())
    }
}

//! License and device flows against the in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use custodian_access::{
    AbuseConfig, AbuseGuard, AccessChecker, AccessError, AuditTrail, CekStore, DeviceConfig,
    DeviceRegistry, EncryptionRequester, LicenseConfig, LicenseManager, Notifier, PortError,
};
use custodian_core::{
    AuditAction, Device, Fingerprint, JobId, JobPriority, License, LicenseStatus, MaterialId,
    Nonce, Platform, UserId,
};
use custodian_store::{AuditRepository, MemoryStore};

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

enum Entitlement {
    Allow,
    Deny,
    Broken,
}

struct Checker(Mutex<Entitlement>);

#[async_trait]
impl AccessChecker for Checker {
    async fn check_access(&self, _: &UserId, _: &MaterialId) -> Result<bool, PortError> {
        match *self.0.lock().unwrap() {
            Entitlement::Allow => Ok(true),
            Entitlement::Deny => Ok(false),
            Entitlement::Broken => Err(PortError::new("entitlement service unavailable")),
        }
    }
}

#[derive(Default)]
struct Requests {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl EncryptionRequester for Requests {
    async fn request_encryption(
        &self,
        _license: &License,
        _priority: JobPriority,
        _now: i64,
    ) -> Result<JobId, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(PortError::new("queue full"))
        } else {
            Ok(JobId::new())
        }
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    checker: Arc<Checker>,
    requests: Arc<Requests>,
    guard: Arc<AbuseGuard>,
    licenses: Arc<LicenseManager>,
    registry: DeviceRegistry,
    keys: CekStore,
}

impl Harness {
    fn new() -> Self {
        Self::with(LicenseConfig::default(), Requests::default())
    }

    fn with(config: LicenseConfig, requests: Requests) -> Self {
        let store = Arc::new(MemoryStore::new());
        let checker = Arc::new(Checker(Mutex::new(Entitlement::Allow)));
        let requests = Arc::new(requests);
        let audit = AuditTrail::new(store.clone());
        let guard = Arc::new(AbuseGuard::new(AbuseConfig::default()).with_audit(audit.clone()));
        let notifier = Notifier::noop();

        let licenses = Arc::new(
            LicenseManager::new(
                store.clone(),
                store.clone(),
                checker.clone(),
                config,
                notifier.clone(),
            )
            .with_guard(guard.clone())
            .with_requester(requests.clone())
            .with_audit(audit.clone()),
        );
        let keys = CekStore::new(store.clone(), notifier.clone()).with_audit(audit.clone());
        let registry = DeviceRegistry::new(
            store.clone(),
            licenses.clone(),
            keys.clone(),
            DeviceConfig::default(),
            notifier,
        )
        .with_audit(audit);

        Self {
            store,
            checker,
            requests,
            guard,
            licenses,
            registry,
            keys,
        }
    }

    async fn device(&self, user: UserId, seed: char) -> Device {
        self.registry
            .register(user, fp(seed), "Tablet", Platform::Android, 0)
            .await
            .unwrap()
    }

    async fn issue(&self, user: UserId, device: &Device, now: i64) -> License {
        self.licenses
            .issue(user, MaterialId::new(), device.id, &device.fingerprint, now)
            .await
            .unwrap()
    }
}

fn fp(seed: char) -> Fingerprint {
    Fingerprint::new(seed.to_string().repeat(64)).unwrap()
}

#[tokio::test]
async fn test_validate_rotate_replay_revoke_scenario() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'a').await;

    let license = h.issue(user, &device, 1_000).await;
    assert_eq!(license.status, LicenseStatus::Active);
    assert_eq!(
        license.offline_grace_period,
        LicenseConfig::default().offline_grace_period
    );
    let original = license.nonce.clone();

    let validated = h
        .licenses
        .validate(&license.id, &device.id, &device.fingerprint, &original, 2_000)
        .await
        .unwrap();
    assert_ne!(validated.nonce, original);
    assert_eq!(validated.last_validated_at, 2_000);

    let replay = h
        .licenses
        .validate(&license.id, &device.id, &device.fingerprint, &original, 3_000)
        .await;
    assert!(matches!(replay, Err(AccessError::InvalidNonce)));

    h.licenses.revoke(&license.id, 4_000).await.unwrap();
    let after_revoke = h
        .licenses
        .validate(&license.id, &device.id, &device.fingerprint, &validated.nonce, 5_000)
        .await;
    assert!(matches!(after_revoke, Err(AccessError::LicenseRevoked)));

    // Renew cannot resurrect it either.
    let renew = h
        .licenses
        .renew(&license.id, &device.id, &device.fingerprint, 6_000)
        .await;
    assert!(matches!(renew, Err(AccessError::LicenseRevoked)));
}

#[tokio::test]
async fn test_issue_reuses_active_license_and_requests_job() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'b').await;
    let material = MaterialId::new();

    let first = h
        .licenses
        .issue(user, material, device.id, &device.fingerprint, 10)
        .await
        .unwrap();
    let second = h
        .licenses
        .issue(user, material, device.id, &device.fingerprint, 20)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.requests.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.licenses.list_active(&user).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_issue_replaces_expired_active_license() {
    let config = LicenseConfig {
        license_duration: Duration::from_secs(60),
        ..LicenseConfig::default()
    };
    let h = Harness::with(config, Requests::default());
    let user = UserId::new();
    let device = h.device(user, 'c').await;
    let material = MaterialId::new();

    let first = h
        .licenses
        .issue(user, material, device.id, &device.fingerprint, 0)
        .await
        .unwrap();
    let second = h
        .licenses
        .issue(user, material, device.id, &device.fingerprint, 2 * 60_000)
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(
        h.licenses.get(&first.id).await.unwrap().status,
        LicenseStatus::Revoked
    );
}

#[tokio::test]
async fn test_issue_preconditions() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'd').await;
    let material = MaterialId::new();

    let stranger = h
        .licenses
        .issue(UserId::new(), material, device.id, &device.fingerprint, 1)
        .await;
    assert!(matches!(stranger, Err(AccessError::DeviceNotRegistered)));

    let wrong_fp = h.licenses.issue(user, material, device.id, &fp('z'), 1).await;
    assert!(matches!(wrong_fp, Err(AccessError::DeviceMismatch)));

    *h.checker.0.lock().unwrap() = Entitlement::Deny;
    let denied = h
        .licenses
        .issue(user, material, device.id, &device.fingerprint, 1)
        .await;
    assert!(matches!(denied, Err(AccessError::AccessDenied)));

    *h.checker.0.lock().unwrap() = Entitlement::Broken;
    let broken = h
        .licenses
        .issue(user, material, device.id, &device.fingerprint, 1)
        .await;
    assert!(matches!(broken, Err(AccessError::AccessDenied)));

    *h.checker.0.lock().unwrap() = Entitlement::Allow;
    h.registry.deregister(&user, &device.id, 2).await.unwrap();
    let revoked = h
        .licenses
        .issue(user, material, device.id, &device.fingerprint, 3)
        .await;
    assert!(matches!(revoked, Err(AccessError::DeviceRevoked)));
}

#[tokio::test]
async fn test_job_request_failure_does_not_fail_issue() {
    let h = Harness::with(
        LicenseConfig::default(),
        Requests {
            fail: true,
            ..Requests::default()
        },
    );
    let user = UserId::new();
    let device = h.device(user, 'e').await;

    let license = h.issue(user, &device, 5).await;
    assert!(license.is_active());
    assert_eq!(h.requests.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_expiry_and_grace_are_computed_at_validation() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'f').await;
    let license = h.issue(user, &device, 0).await;

    // 73 hours offline exceeds the 72 hour grace window.
    let late = h
        .licenses
        .validate(&license.id, &device.id, &device.fingerprint, &license.nonce, 73 * HOUR)
        .await;
    assert!(matches!(late, Err(AccessError::GracePeriodExceeded)));

    // Past expiry, expiry wins over grace.
    let expired = h
        .licenses
        .validate(&license.id, &device.id, &device.fingerprint, &license.nonce, 31 * DAY)
        .await;
    assert!(matches!(expired, Err(AccessError::LicenseExpired)));

    // Status is untouched by either rejection.
    assert!(h.licenses.get(&license.id).await.unwrap().is_active());
}

#[tokio::test]
async fn test_binding_checked_before_nonce() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'g').await;
    let other = h.device(user, 'h').await;
    let license = h.issue(user, &device, 0).await;

    let wrong_device = h
        .licenses
        .validate(&license.id, &other.id, &other.fingerprint, &license.nonce, 1)
        .await;
    assert!(matches!(wrong_device, Err(AccessError::DeviceMismatch)));

    let wrong_fp = h
        .licenses
        .validate(&license.id, &device.id, &other.fingerprint, &Nonce::generate(), 1)
        .await;
    assert!(matches!(wrong_fp, Err(AccessError::DeviceMismatch)));

    let unknown = h
        .licenses
        .validate(
            &custodian_core::LicenseId::new(),
            &device.id,
            &device.fingerprint,
            &license.nonce,
            1,
        )
        .await;
    assert!(matches!(unknown, Err(AccessError::LicenseNotFound)));
}

#[tokio::test]
async fn test_renew_extends_expiry_and_keeps_nonce() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'i').await;
    let license = h.issue(user, &device, 0).await;

    let renewed = h
        .licenses
        .renew(&license.id, &device.id, &device.fingerprint, 10 * DAY)
        .await
        .unwrap();
    assert_eq!(renewed.expires_at, 40 * DAY);
    assert_eq!(renewed.nonce, license.nonce);

    let mismatch = h
        .licenses
        .renew(&license.id, &device.id, &fp('y'), 11 * DAY)
        .await;
    assert!(matches!(mismatch, Err(AccessError::DeviceMismatch)));
}

#[tokio::test]
async fn test_deregister_cascades_to_licenses_and_keys() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'j').await;
    let keep = h.device(user, 'k').await;

    let a = h.issue(user, &device, 0).await;
    let b = h.issue(user, &device, 0).await;
    let kept = h.issue(user, &keep, 0).await;
    for license in [&a, &b, &kept] {
        h.keys
            .store_key(user, license.material_id, license.device_id, vec![7; 32], 1)
            .await
            .unwrap();
    }

    h.registry.deregister(&user, &device.id, 100).await.unwrap();

    for license in [&a, &b] {
        let stored = h.licenses.get(&license.id).await.unwrap();
        assert_eq!(stored.status, LicenseStatus::Revoked);
        assert!(h
            .keys
            .find(&user, &license.material_id, &device.id)
            .await
            .unwrap()
            .is_none());

        let result = h
            .licenses
            .validate(&license.id, &device.id, &device.fingerprint, &license.nonce, 200)
            .await;
        assert!(result.is_err());
    }

    assert!(h.licenses.get(&kept.id).await.unwrap().is_active());
    assert!(h
        .keys
        .find(&user, &kept.material_id, &keep.id)
        .await
        .unwrap()
        .is_some());

    let again = h.registry.deregister(&user, &device.id, 300).await;
    assert!(matches!(again, Err(AccessError::DeviceNotRegistered)));
    assert_eq!(h.registry.list(&user).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_failures_block_device_until_unblocked() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'l').await;
    let license = h.issue(user, &device, 0).await;

    for i in 0..5 {
        let result = h
            .licenses
            .validate(&license.id, &device.id, &device.fingerprint, &Nonce::generate(), 10 + i)
            .await;
        assert!(matches!(result, Err(AccessError::InvalidNonce)));
    }

    // Correct nonce, still rejected.
    let blocked = h
        .licenses
        .validate(&license.id, &device.id, &device.fingerprint, &license.nonce, 20)
        .await;
    match blocked {
        Err(e @ AccessError::DeviceBlocked { .. }) => assert!(e.retry_after().is_some()),
        other => panic!("expected DeviceBlocked, got {other:?}"),
    }

    h.guard.unblock(&device.id);
    h.licenses
        .validate(&license.id, &device.id, &device.fingerprint, &license.nonce, 30)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_validation_consumes_nonce_once() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'm').await;
    let license = h.issue(user, &device, 0).await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let licenses = h.licenses.clone();
        let (license, device) = (license.clone(), device.clone());
        handles.push(tokio::spawn(async move {
            licenses
                .validate(&license.id, &device.id, &device.fingerprint, &license.nonce, 100 + i)
                .await
        }));
    }

    let mut ok = 0;
    let mut rejected = HashSet::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => {
                rejected.insert(e.to_string());
            }
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(
        rejected.into_iter().collect::<Vec<_>>(),
        vec![AccessError::InvalidNonce.to_string()]
    );
}

#[tokio::test]
async fn test_register_policy() {
    let h = Harness::new();
    let user = UserId::new();

    let bad = h
        .registry
        .register(user, Fingerprint::from_raw("short"), "Phone", Platform::Ios, 0)
        .await;
    assert!(matches!(bad, Err(AccessError::Invalid(_))));

    h.device(user, '1').await;
    let dup = h
        .registry
        .register(user, fp('1'), "Phone", Platform::Ios, 0)
        .await;
    assert!(matches!(dup, Err(AccessError::DuplicateDevice)));

    for seed in ['2', '3', '4', '5'] {
        h.device(user, seed).await;
    }
    let over = h
        .registry
        .register(user, fp('6'), "Phone", Platform::Ios, 0)
        .await;
    assert!(matches!(over, Err(AccessError::DeviceLimitExceeded { max: 5 })));
}

#[tokio::test]
async fn test_revoke_variants_are_idempotent() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'n').await;
    let material = MaterialId::new();
    let license = h
        .licenses
        .issue(user, material, device.id, &device.fingerprint, 0)
        .await
        .unwrap();

    assert_eq!(
        h.licenses.revoke_by_user_material(&user, &material, 1).await.unwrap(),
        vec![license.id]
    );
    assert!(h
        .licenses
        .revoke_by_user_material(&user, &material, 2)
        .await
        .unwrap()
        .is_empty());
    assert!(h.licenses.revoke_by_material(&material, 3).await.unwrap().is_empty());
    h.licenses.revoke(&license.id, 4).await.unwrap();

    let stored = h.licenses.get(&license.id).await.unwrap();
    assert_eq!(stored.revoked_at, Some(1));

    let unknown = h.licenses.revoke(&custodian_core::LicenseId::new(), 5).await;
    assert!(matches!(unknown, Err(AccessError::LicenseNotFound)));

    // Store is shared with the registry.
    assert_eq!(
        custodian_store::DeviceRepository::count_active_devices(h.store.as_ref(), &user)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_audit_trail_covers_device_and_license_lifecycle() {
    let h = Harness::new();
    let user = UserId::new();
    let device = h.device(user, 'q').await;
    let license = h.issue(user, &device, 1).await;

    let rotated = h
        .licenses
        .validate(&license.id, &device.id, &device.fingerprint, &license.nonce, 2)
        .await
        .unwrap();
    // Replaying the consumed nonce; the fifth failure blocks the device.
    for at in 3..8 {
        let _ = h
            .licenses
            .validate(&license.id, &device.id, &device.fingerprint, &license.nonce, at)
            .await;
    }
    h.licenses
        .renew(&license.id, &device.id, &device.fingerprint, 9)
        .await
        .unwrap();
    h.registry.deregister(&user, &device.id, 10).await.unwrap();
    assert_ne!(rotated.nonce, license.nonce);

    let (records, total) = h.store.audit_for_device(&device.id, 50, 0).await.unwrap();
    assert_eq!(total as usize, records.len());

    let mut actions: Vec<(AuditAction, bool)> =
        records.iter().map(|r| (r.action, r.success)).collect();
    actions.reverse();
    assert_eq!(
        actions,
        vec![
            (AuditAction::DeviceRegister, true),
            (AuditAction::LicenseIssue, true),
            (AuditAction::LicenseValidate, true),
            (AuditAction::LicenseValidate, false),
            (AuditAction::LicenseValidate, false),
            (AuditAction::LicenseValidate, false),
            (AuditAction::LicenseValidate, false),
            (AuditAction::DeviceBlock, false),
            (AuditAction::LicenseValidate, false),
            (AuditAction::LicenseRenew, true),
            (AuditAction::DeviceDeregister, true),
        ]
    );

    let refused = records
        .iter()
        .find(|r| r.action == AuditAction::LicenseValidate && !r.success)
        .unwrap();
    assert_eq!(refused.resource_id, *license.id.as_uuid());
    assert!(refused.error_code.is_some());

    // Only records with a resolved actor appear in the user's view.
    let (by_user, total) = h.store.audit_for_user(&user, 50, 0).await.unwrap();
    assert_eq!(total, 5);
    assert_eq!(by_user[0].action, AuditAction::DeviceDeregister);
    assert!(by_user.iter().all(|r| r.success));
}

//! End-to-end flows through the Custodian facade.

use std::sync::Arc;
use std::time::Duration;

use custodian::access::AccessError;
use custodian::core::{AuditAction, EventKind, JobStatus, LicenseId, MaterialId, Platform, UserId};
use custodian::jobs::{open_artifact, unwrap_key, InMemorySource, SealingEngine};
use custodian::store::{CekRepository, MemoryStore, SqliteStore, Store};
use custodian::{Custodian, CustodianConfig, CustodianError, Notifier};
use custodian_testkit::{
    fingerprint, AccessMode, RecordingMetrics, RecordingPublisher, Script, ScriptedEngine, StaticAccess,
};

struct Setup<S: Store> {
    custodian: Custodian<S>,
    access: Arc<StaticAccess>,
    engine: Arc<ScriptedEngine>,
    events: Arc<RecordingPublisher>,
    metrics: Arc<RecordingMetrics>,
}

fn fast_config() -> CustodianConfig {
    CustodianConfig {
        poll_interval_ms: Some(10),
        retry_base_delay_ms: Some(10),
        retry_max_delay_ms: Some(20),
        shutdown_timeout_ms: Some(1_000),
        ..CustodianConfig::default()
    }
}

fn setup_with<S: Store + 'static>(store: Arc<S>, config: CustodianConfig) -> Setup<S> {
    custodian::init_tracing("custodian=warn");
    let access = Arc::new(StaticAccess::allow_all());
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed));
    let events = Arc::new(RecordingPublisher::new());
    let metrics = Arc::new(RecordingMetrics::new());
    let custodian = Custodian::with_notifier(
        store,
        access.clone(),
        engine.clone(),
        config,
        Notifier::new(events.clone(), metrics.clone()),
    );
    Setup {
        custodian,
        access,
        engine,
        events,
        metrics,
    }
}

fn setup() -> Setup<MemoryStore> {
    setup_with(Arc::new(MemoryStore::new()), fast_config())
}

async fn wait_for_job<S: Store + 'static>(custodian: &Custodian<S>, license_id: &LicenseId) -> JobStatus {
    for _ in 0..200 {
        let job = custodian.job_for_license(license_id).await.unwrap();
        if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            return job.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job for license {license_id} never finished");
}

#[tokio::test]
async fn test_license_lifecycle() {
    let s = setup();
    let user = UserId::new();
    let material = MaterialId::new();
    let fp = fingerprint(1);

    let device = s
        .custodian
        .register_device(user, fp.clone(), "Reader", Platform::Ios)
        .await
        .unwrap();
    let license = s
        .custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap();

    let next = s
        .custodian
        .validate_license(&license.id, &device.id, &fp, &license.nonce)
        .await
        .unwrap();
    assert_ne!(next.nonce, license.nonce);

    let err = s
        .custodian
        .validate_license(&license.id, &device.id, &fp, &license.nonce)
        .await
        .unwrap_err();
    assert!(matches!(err, CustodianError::Access(AccessError::InvalidNonce)));
    assert_eq!(err.http_status(), 403);

    s.custodian.revoke_license(&license.id).await.unwrap();
    let err = s
        .custodian
        .validate_license(&license.id, &device.id, &fp, &next.nonce)
        .await
        .unwrap_err();
    assert!(matches!(err, CustodianError::Access(AccessError::LicenseRevoked)));

    assert_eq!(s.events.count(EventKind::DeviceRegistered), 1);
    assert_eq!(s.events.count(EventKind::LicenseIssued), 1);
    assert_eq!(s.events.count(EventKind::LicenseValidated), 1);
    assert_eq!(s.events.count(EventKind::LicenseRevoked), 1);
    assert_eq!(s.events.count(EventKind::EncryptionRequested), 1);
    assert_eq!(s.metrics.count("license.validate.failure"), 2);
}

#[tokio::test]
async fn test_issue_requests_one_job_and_denied_users_get_nothing() {
    let s = setup();
    let user = UserId::new();
    let material = MaterialId::new();
    let fp = fingerprint(2);
    let device = s
        .custodian
        .register_device(user, fp.clone(), "Tablet", Platform::Android)
        .await
        .unwrap();

    let license = s
        .custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap();
    let job = s.custodian.job_for_license(&license.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.material_id, material);
    assert_eq!(s.custodian.job(&job.id).await.unwrap(), job);
    assert_eq!(s.custodian.job_for_material(&material).await.unwrap().id, job.id);

    s.access.set_mode(AccessMode::DenyAll);
    let other = MaterialId::new();
    let err = s
        .custodian
        .issue_license(user, other, device.id, &fp)
        .await
        .unwrap_err();
    assert!(matches!(err, CustodianError::Access(AccessError::AccessDenied)));
    let err = s.custodian.job_for_material(&other).await.unwrap_err();
    assert_eq!(err.http_status(), 404);
    assert_eq!(s.custodian.job_counts().await.unwrap().total(), 1);
}

#[tokio::test]
async fn test_download_waits_for_encryption() {
    let s = setup();
    let user = UserId::new();
    let material = MaterialId::new();
    let fp = fingerprint(3);
    let device = s
        .custodian
        .register_device(user, fp.clone(), "Phone", Platform::Android)
        .await
        .unwrap();
    let license = s
        .custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap();

    let err = s
        .custodian
        .authorize_download(&user, &material, &license.id, &device.id, &fp)
        .await
        .unwrap_err();
    assert!(matches!(err, CustodianError::EncryptionPending));
    assert_eq!(err.http_status(), 404);
    assert_eq!(s.custodian.download_quota(&device.id).remaining, 10);

    s.custodian.start_workers().unwrap();
    assert!(s.custodian.workers_running());
    assert_eq!(wait_for_job(&s.custodian, &license.id).await, JobStatus::Completed);
    s.custodian.stop_workers().await;
    assert!(!s.custodian.workers_running());

    let grant = s
        .custodian
        .authorize_download(&user, &material, &license.id, &device.id, &fp)
        .await
        .unwrap();
    assert_eq!(grant.license.id, license.id);
    assert_eq!(grant.key.wrapped_key, ScriptedEngine::WRAPPED_KEY.to_vec());
    assert_eq!(grant.key.key_version, 1);
    assert_eq!(grant.quota.remaining, 9);

    assert_eq!(s.engine.total_calls(), 1);
    assert_eq!(s.events.count(EventKind::EncryptionCompleted), 1);
    assert_eq!(s.events.count(EventKind::KeyGenerated), 1);
    assert_eq!(s.events.count(EventKind::MaterialDownloaded), 1);
}

#[tokio::test]
async fn test_download_checks_binding_and_ownership() {
    let s = setup();
    let user = UserId::new();
    let material = MaterialId::new();
    let fp = fingerprint(4);
    let device = s
        .custodian
        .register_device(user, fp.clone(), "Phone", Platform::Android)
        .await
        .unwrap();
    let license = s
        .custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap();

    let err = s
        .custodian
        .authorize_download(&user, &material, &license.id, &device.id, &fingerprint(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CustodianError::Access(AccessError::DeviceMismatch)));

    let err = s
        .custodian
        .authorize_download(&user, &MaterialId::new(), &license.id, &device.id, &fp)
        .await
        .unwrap_err();
    assert!(matches!(err, CustodianError::Access(AccessError::AccessDenied)));

    let err = s
        .custodian
        .authorize_download(&UserId::new(), &material, &license.id, &device.id, &fp)
        .await
        .unwrap_err();
    assert!(matches!(err, CustodianError::Access(AccessError::AccessDenied)));

    let err = s
        .custodian
        .authorize_download(&user, &material, &LicenseId::new(), &device.id, &fp)
        .await
        .unwrap_err();
    assert!(matches!(err, CustodianError::Access(AccessError::LicenseNotFound)));
}

#[tokio::test]
async fn test_download_rate_limit() {
    let s = setup();
    let user = UserId::new();
    let material = MaterialId::new();
    let fp = fingerprint(6);
    let device = s
        .custodian
        .register_device(user, fp.clone(), "Phone", Platform::Ios)
        .await
        .unwrap();
    let license = s
        .custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap();

    s.custodian.start_workers().unwrap();
    wait_for_job(&s.custodian, &license.id).await;
    s.custodian.stop_workers().await;

    for expected in (0..10).rev() {
        let grant = s
            .custodian
            .authorize_download(&user, &material, &license.id, &device.id, &fp)
            .await
            .unwrap();
        assert_eq!(grant.quota.remaining, expected);
    }

    let err = s
        .custodian
        .authorize_download(&user, &material, &license.id, &device.id, &fp)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CustodianError::Access(AccessError::RateLimitExceeded { .. })
    ));
    assert_eq!(err.http_status(), 429);
    assert!(err.retry_after().is_some());
    assert_eq!(s.events.count(EventKind::MaterialDownloaded), 10);
}

#[tokio::test]
async fn test_material_download_limit_spans_devices() {
    let config = CustodianConfig {
        max_downloads_per_material_window: Some(2),
        ..fast_config()
    };
    let s = setup_with(Arc::new(MemoryStore::new()), config);
    let material = MaterialId::new();

    let mut readers = Vec::new();
    for seed in [30, 31] {
        let user = UserId::new();
        let fp = fingerprint(seed);
        let device = s
            .custodian
            .register_device(user, fp.clone(), "Tablet", Platform::Android)
            .await
            .unwrap();
        let license = s
            .custodian
            .issue_license(user, material, device.id, &fp)
            .await
            .unwrap();
        readers.push((user, fp, device, license));
    }

    s.custodian.start_workers().unwrap();
    for (_, _, _, license) in &readers {
        wait_for_job(&s.custodian, &license.id).await;
    }
    s.custodian.stop_workers().await;

    let (user, fp, device, license) = &readers[0];
    for _ in 0..2 {
        s.custodian
            .authorize_download(user, &material, &license.id, &device.id, fp)
            .await
            .unwrap();
    }
    assert_eq!(s.custodian.material_quota(&material).remaining, 0);

    let (other_user, other_fp, other_device, other_license) = &readers[1];
    let err = s
        .custodian
        .authorize_download(other_user, &material, &other_license.id, &other_device.id, other_fp)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CustodianError::Access(AccessError::MaterialRateLimitExceeded { .. })
    ));
    assert_eq!(err.http_status(), 429);
    assert_eq!(s.custodian.download_quota(&other_device.id).remaining, 10);

    let (records, total) = s
        .custodian
        .device_audit_log(&other_device.id, 1, 0)
        .await
        .unwrap();
    // Register, issue, key, refused download.
    assert_eq!(total, 4);
    assert_eq!(records[0].action, AuditAction::MaterialDownload);
    assert!(!records[0].success);
    assert_eq!(
        records[0].error_code.as_deref(),
        Some("material_rate_limit_exceeded")
    );
    assert_eq!(records[0].user_id, Some(*other_user));
}

#[tokio::test]
async fn test_repeated_failures_block_device() {
    let s = setup();
    let user = UserId::new();
    let fp = fingerprint(7);
    let device = s
        .custodian
        .register_device(user, fp.clone(), "Phone", Platform::Desktop)
        .await
        .unwrap();
    let license = s
        .custodian
        .issue_license(user, MaterialId::new(), device.id, &fp)
        .await
        .unwrap();

    let wrong = custodian::Nonce::generate();
    for _ in 0..5 {
        let err = s
            .custodian
            .validate_license(&license.id, &device.id, &fp, &wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, CustodianError::Access(AccessError::InvalidNonce)));
    }

    let err = s
        .custodian
        .validate_license(&license.id, &device.id, &fp, &license.nonce)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CustodianError::Access(AccessError::DeviceBlocked { .. })
    ));
    assert_eq!(err.http_status(), 429);

    s.custodian.unblock_device(&device.id);
    s.custodian
        .validate_license(&license.id, &device.id, &fp, &license.nonce)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_deregister_revokes_licenses_and_keys() {
    let s = setup();
    let user = UserId::new();
    let material = MaterialId::new();
    let fp = fingerprint(8);
    let device = s
        .custodian
        .register_device(user, fp.clone(), "Laptop", Platform::Desktop)
        .await
        .unwrap();
    let license = s
        .custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap();

    s.custodian.start_workers().unwrap();
    wait_for_job(&s.custodian, &license.id).await;
    s.custodian.stop_workers().await;
    assert!(s
        .custodian
        .store()
        .find_cek(&user, &material, &device.id)
        .await
        .unwrap()
        .is_some());

    s.custodian.deregister_device(&user, &device.id).await.unwrap();

    assert!(s.custodian.list_devices(&user).await.unwrap().is_empty());
    assert!(s.custodian.active_licenses(&user).await.unwrap().is_empty());
    assert!(s.custodian.license(&license.id).await.unwrap().is_revoked());
    assert!(s
        .custodian
        .store()
        .find_cek(&user, &material, &device.id)
        .await
        .unwrap()
        .is_none());

    let err = s
        .custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap_err();
    assert!(matches!(err, CustodianError::Access(AccessError::DeviceRevoked)));
    assert_eq!(s.events.count(EventKind::DeviceDeregistered), 1);
}

#[tokio::test]
async fn test_withdraw_material() {
    let s = setup();
    let user = UserId::new();
    let material = MaterialId::new();
    let kept = MaterialId::new();
    let fp = fingerprint(9);
    let device = s
        .custodian
        .register_device(user, fp.clone(), "Phone", Platform::Android)
        .await
        .unwrap();
    let withdrawn = s
        .custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap();
    let other = s
        .custodian
        .issue_license(user, kept, device.id, &fp)
        .await
        .unwrap();

    s.custodian.start_workers().unwrap();
    wait_for_job(&s.custodian, &withdrawn.id).await;
    wait_for_job(&s.custodian, &other.id).await;
    s.custodian.stop_workers().await;

    let revoked = s.custodian.withdraw_material(&material).await.unwrap();
    assert_eq!(revoked, vec![withdrawn.id]);

    let store = s.custodian.store();
    assert!(store.find_cek(&user, &material, &device.id).await.unwrap().is_none());
    assert!(store.find_cek(&user, &kept, &device.id).await.unwrap().is_some());

    let active = s.custodian.active_licenses(&user).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, other.id);
}

#[tokio::test]
async fn test_revoke_entitlement() {
    let s = setup();
    let user = UserId::new();
    let material = MaterialId::new();
    let fp_a = fingerprint(10);
    let fp_b = fingerprint(11);

    let a = s
        .custodian
        .register_device(user, fp_a.clone(), "A", Platform::Ios)
        .await
        .unwrap();
    let b = s
        .custodian
        .register_device(user, fp_b.clone(), "B", Platform::Android)
        .await
        .unwrap();
    s.custodian.issue_license(user, material, a.id, &fp_a).await.unwrap();
    s.custodian.issue_license(user, material, b.id, &fp_b).await.unwrap();

    let revoked = s.custodian.revoke_entitlement(&user, &material).await.unwrap();
    assert_eq!(revoked.len(), 2);
    assert!(s.custodian.active_licenses(&user).await.unwrap().is_empty());
    assert!(s
        .custodian
        .revoke_entitlement(&user, &material)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_failed_jobs_surface_through_facade() {
    let s = setup_with(
        Arc::new(MemoryStore::new()),
        CustodianConfig {
            max_job_retries: Some(1),
            ..fast_config()
        },
    );
    s.engine.set_script(Script::AlwaysFail);

    let user = UserId::new();
    let fp = fingerprint(12);
    let device = s
        .custodian
        .register_device(user, fp.clone(), "Phone", Platform::Android)
        .await
        .unwrap();
    let license = s
        .custodian
        .issue_license(user, MaterialId::new(), device.id, &fp)
        .await
        .unwrap();

    s.custodian.start_workers().unwrap();
    assert_eq!(wait_for_job(&s.custodian, &license.id).await, JobStatus::Failed);
    s.custodian.stop_workers().await;

    let job = s.custodian.job_for_license(&license.id).await.unwrap();
    let expected = format!("material source: {}", ScriptedEngine::FAILURE);
    assert_eq!(job.error_message.as_deref(), Some(expected.as_str()));
    assert_eq!(s.events.count(EventKind::EncryptionFailed), 1);

    let counts = s.custodian.job_counts().await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(s.custodian.cleanup_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn test_worker_lifecycle() {
    let s = setup();
    s.custodian.start_workers().unwrap();

    let err = s.custodian.start_workers().unwrap_err();
    assert_eq!(err.http_status(), 409);

    s.custodian.stop_workers().await;
    s.custodian.stop_workers().await;
    assert!(!s.custodian.workers_running());

    s.custodian.start_workers().unwrap();
    assert!(s.custodian.workers_running());
    s.custodian.stop_workers().await;
}

#[tokio::test]
async fn test_sqlite_backend_with_sealing_engine() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("custodian.db")).unwrap());
    let source = Arc::new(InMemorySource::new());
    let engine = Arc::new(SealingEngine::new(source.clone(), store.clone()));
    let custodian = Custodian::new(
        store,
        Arc::new(StaticAccess::allow_all()),
        engine.clone(),
        fast_config(),
    );

    let user = UserId::new();
    let material = MaterialId::new();
    source.insert(material, &b"chapter one"[..]);
    let fp = fingerprint(13);
    let device = custodian
        .register_device(user, fp.clone(), "Reader", Platform::Android)
        .await
        .unwrap();
    let license = custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap();

    custodian.start_workers().unwrap();
    assert_eq!(wait_for_job(&custodian, &license.id).await, JobStatus::Completed);
    custodian.stop_workers().await;

    let grant = custodian
        .authorize_download(&user, &material, &license.id, &device.id, &fp)
        .await
        .unwrap();
    let cek = unwrap_key(&device.id, &fp, &grant.key.wrapped_key).unwrap();
    let artifact = engine.artifact(&material, &device.id).unwrap();
    assert_eq!(open_artifact(&cek, &artifact).unwrap(), b"chapter one");

    let next = custodian
        .validate_license(&license.id, &device.id, &fp, &license.nonce)
        .await
        .unwrap();
    assert_eq!(custodian.license(&license.id).await.unwrap().nonce, next.nonce);
}

#[tokio::test]
async fn test_rotated_keys_still_open_content() {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(InMemorySource::new());
    let engine = Arc::new(SealingEngine::new(source.clone(), store.clone()));
    let custodian = Custodian::new(
        store,
        Arc::new(StaticAccess::allow_all()),
        engine.clone(),
        fast_config(),
    );

    let user = UserId::new();
    let material = MaterialId::new();
    source.insert(material, &b"appendix"[..]);
    let fp = fingerprint(32);
    let device = custodian
        .register_device(user, fp.clone(), "Reader", Platform::Ios)
        .await
        .unwrap();
    let license = custodian
        .issue_license(user, material, device.id, &fp)
        .await
        .unwrap();

    custodian.start_workers().unwrap();
    assert_eq!(wait_for_job(&custodian, &license.id).await, JobStatus::Completed);
    custodian.stop_workers().await;

    let report = custodian.rotate_keys(1, 2, engine.as_ref()).await.unwrap();
    assert_eq!(report.rotated, 1);
    assert_eq!(report.failed, 0);
    assert!(matches!(
        custodian.rotate_keys(2, 2, engine.as_ref()).await,
        Err(CustodianError::Access(AccessError::Invalid(_)))
    ));

    let grant = custodian
        .authorize_download(&user, &material, &license.id, &device.id, &fp)
        .await
        .unwrap();
    assert_eq!(grant.key.key_version, 2);
    let cek = unwrap_key(&device.id, &fp, &grant.key.wrapped_key).unwrap();
    let artifact = engine.artifact(&material, &device.id).unwrap();
    assert_eq!(open_artifact(&cek, &artifact).unwrap(), b"appendix");

    let (records, total) = custodian.audit_log(&user, 10, 0).await.unwrap();
    let actions: Vec<_> = records.iter().map(|r| r.action).collect();
    assert_eq!(total, 5);
    assert_eq!(
        actions,
        vec![
            AuditAction::MaterialDownload,
            AuditAction::KeyRotate,
            AuditAction::KeyGenerate,
            AuditAction::LicenseIssue,
            AuditAction::DeviceRegister,
        ]
    );
    assert!(records.iter().all(|r| r.success));
}

#[tokio::test]
async fn test_config_file_drives_limits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custodian.json");
    std::fs::write(
        &path,
        r#"{ "max_devices_per_user": 1, "max_downloads_per_window": 2, "poll_interval_ms": 10 }"#,
    )
    .unwrap();

    let config = CustodianConfig::load(&path).unwrap();
    let s = setup_with(Arc::new(MemoryStore::new()), config);
    let user = UserId::new();

    s.custodian
        .register_device(user, fingerprint(14), "One", Platform::Ios)
        .await
        .unwrap();
    let err = s
        .custodian
        .register_device(user, fingerprint(15), "Two", Platform::Ios)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CustodianError::Access(AccessError::DeviceLimitExceeded { max: 1 })
    ));

    let device = s.custodian.list_devices(&user).await.unwrap().remove(0);
    assert_eq!(s.custodian.download_quota(&device.id).remaining, 2);

    assert!(CustodianConfig::load(dir.path().join("missing.json")).is_err());
}

//! Scripted and recording collaborators.
//!
//! Every double is `Send + Sync` and cheap to share behind an `Arc`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use custodian_access::{AccessChecker, PortError};
use custodian_core::{
    Event, EventKind, EventPublisher, JobId, MaterialId, MetricsSink, PublishError, UserId,
};
use custodian_jobs::{EncryptionEngine, EncryptionOutput, EncryptionRequest, EngineError};

// ─────────────────────────────────────────────────────────────────────────────
// Access
// ─────────────────────────────────────────────────────────────────────────────

/// How [`StaticAccess`] answers.
#[derive(Debug, Clone)]
pub enum AccessMode {
    AllowAll,
    DenyAll,
    /// Every check errors.
    Unavailable,
    /// Only the listed (user, material) pairs are allowed.
    Only(HashSet<(UserId, MaterialId)>),
}

/// Entitlement checker with a switchable answer.
pub struct StaticAccess {
    mode: Mutex<AccessMode>,
}

impl StaticAccess {
    pub fn new(mode: AccessMode) -> Self {
        Self {
            mode: Mutex::new(mode),
        }
    }

    pub fn allow_all() -> Self {
        Self::new(AccessMode::AllowAll)
    }

    pub fn deny_all() -> Self {
        Self::new(AccessMode::DenyAll)
    }

    pub fn set_mode(&self, mode: AccessMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Allow one pair, switching to an allow-list if needed.
    pub fn grant(&self, user_id: UserId, material_id: MaterialId) {
        let mut mode = self.mode.lock().unwrap();
        match &mut *mode {
            AccessMode::Only(pairs) => {
                pairs.insert((user_id, material_id));
            }
            _ => *mode = AccessMode::Only(HashSet::from([(user_id, material_id)])),
        }
    }
}

#[async_trait]
impl AccessChecker for StaticAccess {
    async fn check_access(&self, user_id: &UserId, material_id: &MaterialId) -> Result<bool, PortError> {
        match &*self.mode.lock().unwrap() {
            AccessMode::AllowAll => Ok(true),
            AccessMode::DenyAll => Ok(false),
            AccessMode::Unavailable => Err(PortError::new("entitlement service unavailable")),
            AccessMode::Only(pairs) => Ok(pairs.contains(&(*user_id, *material_id))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events and metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps every published event; can be switched to fail.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<Event>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// While failing, events are rejected and not recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: &Event) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::new(event.kind, "publisher switched off"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Counts increments and keeps observations per metric name.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    observations: Mutex<HashMap<&'static str, Vec<Duration>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn observations(&self, name: &str) -> usize {
        self.observations
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, Vec::len)
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment(&self, name: &'static str) {
        *self.counters.lock().unwrap().entry(name).or_insert(0) += 1;
    }

    fn observe(&self, name: &'static str, elapsed: Duration) {
        self.observations
            .lock()
            .unwrap()
            .entry(name)
            .or_default()
            .push(elapsed);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// What [`ScriptedEngine`] does on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Succeed,
    /// Fail the first `n` attempts of each job, then succeed.
    FailTimes(u32),
    AlwaysFail,
    /// Sleep far longer than any sane job timeout.
    Hang,
}

/// Engine that follows a script and counts attempts per job.
///
/// Successful runs return the wrapped key `[0xAB; 60]`.
pub struct ScriptedEngine {
    script: Mutex<Script>,
    calls: Mutex<HashMap<JobId, u32>>,
}

impl ScriptedEngine {
    pub const WRAPPED_KEY: [u8; 60] = [0xAB; 60];
    pub const FAILURE: &'static str = "scripted failure";

    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self, job_id: &JobId) -> u32 {
        self.calls.lock().unwrap().get(job_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl EncryptionEngine for ScriptedEngine {
    async fn encrypt(&self, request: &EncryptionRequest) -> Result<EncryptionOutput, EngineError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(request.job_id).or_insert(0);
            *n += 1;
            *n
        };
        let script = *self.script.lock().unwrap();

        let fail = match script {
            Script::Succeed => false,
            Script::FailTimes(n) => attempt <= n,
            Script::AlwaysFail => true,
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                false
            }
        };
        if fail {
            return Err(EngineError::Source(Self::FAILURE.into()));
        }
        Ok(EncryptionOutput {
            wrapped_key: Self::WRAPPED_KEY.to_vec(),
            artifact: Bytes::from_static(b"scripted artifact"),
        })
    }
}

//! Best-effort security audit trail.

use std::sync::Arc;

use custodian_core::AuditRecord;
use custodian_store::AuditRepository;

/// Appends audit records.
///
/// Like [`Notifier`](crate::Notifier), a failed append never fails the
/// operation being audited; it is logged at `warn`.
#[derive(Clone, Default)]
pub struct AuditTrail {
    repo: Option<Arc<dyn AuditRepository>>,
}

impl AuditTrail {
    pub fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo: Some(repo) }
    }

    /// A trail that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn record(&self, record: AuditRecord) {
        let Some(repo) = &self.repo else {
            return;
        };
        if let Err(e) = repo.append_audit(&record).await {
            tracing::warn!(
                action = %record.action,
                resource_id = %record.resource_id,
                error = %e,
                "audit append failed"
            );
        }
    }
}

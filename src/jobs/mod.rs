//! Scheduled Jobs
//!
//! Background maintenance: expired idempotency keys are purged, abandoned
//! reservations are reset, and the ledger is periodically reconciled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;

use crate::query::{QueryError, QueryService};
use crate::store::{IdempotencyStore, Storage, StoreError};

/// Reservations left PENDING longer than this are considered abandoned
pub const STALE_RESERVATION_AGE: Duration = Duration::from_secs(5 * 60);

// =========================================================================
// Idempotency maintenance
// =========================================================================

/// Delete idempotency keys past their expiry
pub async fn purge_expired_idempotency_keys(storage: &dyn Storage) -> Result<u64, JobError> {
    let rows_deleted = storage.purge_expired(Utc::now()).await?;

    if rows_deleted > 0 {
        tracing::info!(rows_deleted, "Deleted expired idempotency keys");
    }

    Ok(rows_deleted)
}

/// Drop PENDING reservations whose holder never finished, so the client
/// can retry with the same key
pub async fn reset_stale_reservations(storage: &dyn Storage) -> Result<u64, JobError> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(STALE_RESERVATION_AGE)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
    let rows_affected = storage.reset_stale(cutoff).await?;

    if rows_affected > 0 {
        tracing::warn!(rows_affected, "Reset stale idempotency reservations");
    }

    Ok(rows_affected)
}

// =========================================================================
// Reconciliation
// =========================================================================

/// Replay the ledger and log every discrepancy. Returns the number of
/// mismatched accounts.
pub async fn reconcile_ledger(query: &QueryService) -> Result<usize, JobError> {
    let report = query.verify_ledger().await?;

    for mismatch in &report.mismatches {
        tracing::error!(
            account_id = %mismatch.account_id,
            stored = mismatch.stored,
            replayed = mismatch.replayed,
            "Stored balance disagrees with ledger"
        );
    }
    for entry_id in &report.overdrawn_entries {
        tracing::error!(entry_id = %entry_id, "Ledger replay went negative");
    }
    for entry_id in &report.orphan_entries {
        tracing::error!(entry_id = %entry_id, "Ledger entry references unknown account");
    }

    Ok(report.mismatches.len())
}

// =========================================================================
// Job Scheduler
// =========================================================================

#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval for idempotency key maintenance (default: 1 minute)
    pub idempotency_maintenance_interval: Duration,
    /// Interval for ledger reconciliation (default: 1 hour)
    pub reconciliation_interval: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            idempotency_maintenance_interval: Duration::from_secs(60),
            reconciliation_interval: Duration::from_secs(3600),
        }
    }
}

/// Job Scheduler - runs periodic maintenance tasks
pub struct JobScheduler {
    storage: Arc<dyn Storage>,
    query: QueryService,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_config(storage, JobSchedulerConfig::default())
    }

    pub fn with_config(storage: Arc<dyn Storage>, config: JobSchedulerConfig) -> Self {
        let query = QueryService::new(storage.clone());
        Self {
            storage,
            query,
            config,
        }
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        tracing::info!(backend = self.storage.backend_name(), "Job scheduler started");

        let mut idempotency_interval = interval(self.config.idempotency_maintenance_interval);
        let mut reconciliation_interval = interval(self.config.reconciliation_interval);

        loop {
            tokio::select! {
                _ = idempotency_interval.tick() => {
                    if let Err(e) = reset_stale_reservations(self.storage.as_ref()).await {
                        tracing::error!(error = %e, "Idempotency reservation reset failed");
                    }
                    if let Err(e) = purge_expired_idempotency_keys(self.storage.as_ref()).await {
                        tracing::error!(error = %e, "Idempotency key deletion failed");
                    }
                }
                _ = reconciliation_interval.tick() => {
                    if let Err(e) = reconcile_ledger(&self.query).await {
                        tracing::error!(error = %e, "Ledger reconciliation failed");
                    }
                }
            }
        }
    }

    /// Run all maintenance jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match reset_stale_reservations(self.storage.as_ref()).await {
            Ok(count) => report.idempotency_keys_reset = count,
            Err(e) => report.errors.push(format!("Idempotency reset: {}", e)),
        }

        match purge_expired_idempotency_keys(self.storage.as_ref()).await {
            Ok(count) => report.idempotency_keys_deleted = count,
            Err(e) => report.errors.push(format!("Idempotency deletion: {}", e)),
        }

        match reconcile_ledger(&self.query).await {
            Ok(count) => report.balance_mismatches = count,
            Err(e) => report.errors.push(format!("Reconciliation: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub idempotency_keys_reset: u64,
    pub idempotency_keys_deleted: u64,
    pub balance_mismatches: usize,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::IdempotencyRecord;
    use crate::store::MemoryStorage;

    #[test]
    fn test_job_scheduler_config_default() {
        let config = JobSchedulerConfig::default();
        assert_eq!(config.idempotency_maintenance_interval, Duration::from_secs(60));
        assert_eq!(config.reconciliation_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_maintenance_report_default() {
        let report = MaintenanceReport::default();
        assert_eq!(report.idempotency_keys_deleted, 0);
        assert_eq!(report.errors.len(), 0);
    }

    #[tokio::test]
    async fn test_run_all_once_purges_expired_keys() {
        let storage = MemoryStorage::new();
        let expired = IdempotencyRecord::pending("old", "fp", chrono::Duration::seconds(-1));
        tokio_test::assert_ok!(storage.reserve(&expired).await);
        let live = IdempotencyRecord::pending("new", "fp", chrono::Duration::hours(1));
        tokio_test::assert_ok!(storage.reserve(&live).await);

        let scheduler = JobScheduler::new(Arc::new(storage.clone()));
        let report = scheduler.run_all_once().await;

        assert!(report.errors.is_empty());
        assert_eq!(report.idempotency_keys_deleted, 1);
        assert_eq!(report.balance_mismatches, 0);
        assert!(storage.get_idempotency("old").await.unwrap().is_none());
        assert!(storage.get_idempotency("new").await.unwrap().is_some());
    }
}

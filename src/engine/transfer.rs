//! Transfer Engine
//!
//! Validates and atomically executes one balance-affecting operation:
//! debit, credit and the COMMITTED ledger entry share a single atomic
//! scope, guarded by an idempotency reservation taken beforehand.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use super::error::EngineError;
use super::state::{OperationState, StateTracker};
use crate::domain::{
    AccountRef, Actor, Amount, LedgerEntry, Movement, OperationContext, OperationKind,
    OperationReceipt, OperationRequest, ValidationError,
};
use crate::idempotency::{self, IdempotencyGuard, IdempotencyRecord, Reservation};
use crate::store::{
    AccountStore, AtomicScope, IdempotencyStore, LedgerStore, Storage, StoreError, StoreResult,
};

pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_millis(2_000);
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on idempotency lookup plus account resolution
    pub validation_timeout: Duration,
    pub max_commit_attempts: u32,
    /// Linear backoff unit between commit attempts
    pub retry_backoff: Duration,
    /// Use the agent's own account as the float leg of cash operations
    pub agent_float: bool,
    pub idempotency_ttl: chrono::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            agent_float: true,
            idempotency_ttl: chrono::Duration::hours(24),
        }
    }
}

/// Outcome of the VALIDATED step
enum Validated {
    Replay(OperationReceipt),
    Fresh(Prepared),
}

struct Prepared {
    movement: Movement,
    record: IdempotencyRecord,
}

/// Validation running on its own task. Dropped before its result was
/// taken (timeout, or the caller went away), it releases any reservation
/// the task acquires once the task finishes.
struct ValidationTask {
    handle: Option<JoinHandle<Result<Validated, EngineError>>>,
    guard: IdempotencyGuard,
}

impl ValidationTask {
    fn spawn<F>(guard: IdempotencyGuard, validation: F) -> Self
    where
        F: std::future::Future<Output = Result<Validated, EngineError>> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(validation)),
            guard,
        }
    }

    /// `None` if the task did not finish within `limit`
    async fn join(
        &mut self,
        limit: Duration,
    ) -> Option<Result<Result<Validated, EngineError>, JoinError>> {
        let handle = self.handle.as_mut()?;
        let joined = tokio::time::timeout(limit, handle).await.ok()?;
        self.handle = None;
        Some(joined)
    }
}

impl Drop for ValidationTask {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let guard = self.guard.clone();
        runtime.spawn(async move {
            if let Ok(Ok(Validated::Fresh(prepared))) = handle.await {
                tracing::debug!(key = %prepared.record.key, "Releasing reservation of abandoned validation");
                guard.release(&prepared.record).await;
            }
        });
    }
}

#[derive(Clone)]
pub struct TransferEngine {
    storage: Arc<dyn Storage>,
    guard: IdempotencyGuard,
    config: EngineConfig,
}

impl TransferEngine {
    pub fn new(storage: Arc<dyn Storage>, config: EngineConfig) -> Self {
        let guard = IdempotencyGuard::new(storage.clone(), config.idempotency_ttl);
        Self {
            storage,
            guard,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute one operation for `actor`.
    ///
    /// Submitting the same idempotency key again returns the first receipt
    /// without re-executing. Once the atomic scope has started it runs to
    /// completion even if the caller stops waiting.
    pub async fn execute(
        &self,
        actor: &Actor,
        request: OperationRequest,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, EngineError> {
        let operation_id = Uuid::new_v4();
        let kind = request.kind;
        let mut tracker = StateTracker::new(operation_id);

        let result = self
            .run(&mut tracker, *actor, request, ctx.correlation_id)
            .await;

        match &result {
            Ok(receipt) => tracing::info!(
                operation_id = %operation_id,
                kind = %kind,
                actor = %actor.account_id,
                ledger_entry_id = %receipt.ledger_entry_id,
                amount = receipt.amount.minor_units(),
                new_balance = receipt.new_balance.minor_units(),
                "Operation committed"
            ),
            Err(e) if e.is_client_error() => tracing::warn!(
                operation_id = %operation_id,
                kind = %kind,
                actor = %actor.account_id,
                state = %tracker.state(),
                error = %e,
                "Operation rejected"
            ),
            Err(e) => tracing::error!(
                operation_id = %operation_id,
                kind = %kind,
                actor = %actor.account_id,
                state = %tracker.state(),
                error = %e,
                "Operation failed"
            ),
        }

        result
    }

    async fn run(
        &self,
        tracker: &mut StateTracker,
        actor: Actor,
        request: OperationRequest,
        correlation_id: Option<Uuid>,
    ) -> Result<OperationReceipt, EngineError> {
        let (amount, key) = match check_request(&actor, &request) {
            Ok(checked) => checked,
            Err(e) => {
                tracker.advance(OperationState::Failed);
                return Err(e.into());
            }
        };
        let fingerprint = idempotency::fingerprint(&actor, &request);

        let prepared = match self
            .validate_bounded(actor, request.kind, request.destination, key, fingerprint)
            .await
        {
            Ok(Validated::Replay(receipt)) => {
                tracker.advance(OperationState::Validated);
                tracker.advance(OperationState::Committed);
                return Ok(receipt);
            }
            Ok(Validated::Fresh(prepared)) => prepared,
            Err(e) => {
                tracker.advance(OperationState::Failed);
                return Err(e);
            }
        };
        tracker.advance(OperationState::Validated);

        let pending = LedgerEntry::pending(
            &prepared.movement,
            amount,
            actor.account_id,
            prepared.record.key.clone(),
            correlation_id,
        );
        tracker.advance(OperationState::Reserved);

        // Detached so dropping the caller cannot cancel a started scope
        let engine = self.clone();
        let outcome = tokio::spawn(async move {
            engine
                .run_scope(prepared.movement, pending, prepared.record)
                .await
        })
        .await
        .map_err(|e| EngineError::Storage(format!("atomic scope task failed: {}", e)))
        .and_then(|result| result);

        match outcome {
            Ok(receipt) => {
                tracker.advance(OperationState::Committed);
                Ok(receipt)
            }
            Err(e) => {
                tracker.advance(OperationState::RolledBack);
                Err(e)
            }
        }
    }

    /// VALIDATED step under `validation_timeout`. If the step does not
    /// finish in time, or this future is dropped while waiting, the step is
    /// left to finish in the background and any reservation it took is
    /// released.
    async fn validate_bounded(
        &self,
        actor: Actor,
        kind: OperationKind,
        destination: Option<AccountRef>,
        key: String,
        fingerprint: String,
    ) -> Result<Validated, EngineError> {
        let engine = self.clone();
        let mut task = ValidationTask::spawn(self.guard.clone(), async move {
            engine
                .validate(actor, kind, destination.as_ref(), &key, &fingerprint)
                .await
        });

        match task.join(self.config.validation_timeout).await {
            Some(joined) => joined
                .map_err(|e| EngineError::Storage(format!("validation task failed: {}", e)))?,
            None => {
                tracing::warn!(
                    actor = %actor.account_id,
                    kind = %kind,
                    timeout_ms = self.config.validation_timeout.as_millis() as u64,
                    "Validation timed out"
                );
                Err(EngineError::Timeout("validation"))
            }
        }
    }

    /// Wait for an in-flight holder of the same key. Shorter than the
    /// validation timeout so the wait can end in its own error.
    fn settle_budget(&self) -> Duration {
        self.config.validation_timeout * 3 / 4
    }

    async fn validate(
        &self,
        actor: Actor,
        kind: OperationKind,
        destination: Option<&AccountRef>,
        key: &str,
        fingerprint: &str,
    ) -> Result<Validated, EngineError> {
        let record = match self
            .guard
            .settle(key, fingerprint, self.settle_budget())
            .await?
        {
            Reservation::Acquired(record) => record,
            Reservation::Completed { ledger_entry_id } => {
                tracing::info!(key = %key, ledger_entry_id = %ledger_entry_id, "Replaying committed operation");
                return self.replay(ledger_entry_id).await.map(Validated::Replay);
            }
            Reservation::Conflict => {
                return Err(ValidationError::IdempotencyKeyReused(key.to_string()).into())
            }
            Reservation::InFlight => return Err(EngineError::Timeout("idempotency")),
        };

        match self.resolve(actor, kind, destination).await {
            Ok(movement) => Ok(Validated::Fresh(Prepared { movement, record })),
            Err(e) => {
                self.guard.release(&record).await;
                Err(e)
            }
        }
    }

    /// Resolve the counterparty and check every account taking part
    async fn resolve(
        &self,
        actor: Actor,
        kind: OperationKind,
        destination: Option<&AccountRef>,
    ) -> Result<Movement, EngineError> {
        let counterparty = match destination {
            None => None,
            Some(AccountRef::Id(id)) => self.storage.get_account(*id).await?,
            Some(AccountRef::Handle(handle)) => self.storage.find_account_by_handle(handle).await?,
        };
        if let (Some(reference), None) = (destination, &counterparty) {
            return Err(EngineError::AccountNotFound(reference.to_string()));
        }

        let movement = Movement::resolve(
            kind,
            actor.account_id,
            counterparty.map(|account| account.id),
            self.config.agent_float,
        )?;

        for account_id in movement.lock_order() {
            let account = self
                .storage
                .get_account(account_id)
                .await?
                .ok_or_else(|| EngineError::AccountNotFound(account_id.to_string()))?;
            if !account.is_active() {
                return Err(ValidationError::account_not_active(account.id, account.status).into());
            }
        }

        Ok(movement)
    }

    async fn replay(&self, ledger_entry_id: Uuid) -> Result<OperationReceipt, EngineError> {
        self.storage
            .get_entry(ledger_entry_id)
            .await?
            .and_then(|entry| entry.receipt())
            .ok_or_else(|| {
                EngineError::Storage(format!(
                    "committed ledger entry {} not found",
                    ledger_entry_id
                ))
            })
    }

    /// RESERVED step: commit with retries, or record the failure
    async fn run_scope(
        &self,
        movement: Movement,
        pending: LedgerEntry,
        record: IdempotencyRecord,
    ) -> Result<OperationReceipt, EngineError> {
        match self.commit_with_retry(&movement, &pending, &record).await {
            Ok(entry) => entry.receipt().ok_or_else(|| {
                EngineError::Storage(format!("entry {} committed without balances", entry.id))
            }),
            Err(StoreError::DuplicateIdempotencyKey(key)) => {
                // Our reservation went stale and another request took the key
                match self.storage.get_idempotency(&key).await? {
                    Some(current)
                        if current.is_completed() && current.fingerprint == record.fingerprint =>
                    {
                        let ledger_entry_id = current.ledger_entry_id.ok_or_else(|| {
                            EngineError::Storage(format!("completed key {} has no entry", key))
                        })?;
                        self.replay(ledger_entry_id).await
                    }
                    Some(current) if current.fingerprint != record.fingerprint => {
                        Err(ValidationError::IdempotencyKeyReused(key).into())
                    }
                    // Reset or held by a resubmission of this request; the key
                    // is usable again, nothing was applied
                    _ => {
                        tracing::warn!(key = %key, "Idempotency reservation lost before commit");
                        Err(EngineError::Timeout("idempotency"))
                    }
                }
            }
            Err(e) => {
                let error = if e.is_version_conflict() {
                    EngineError::Contention {
                        attempts: self.config.max_commit_attempts,
                    }
                } else {
                    EngineError::from(e)
                };
                self.record_failure(pending, &error).await;
                self.guard.release(&record).await;
                Err(error)
            }
        }
    }

    async fn commit_with_retry(
        &self,
        movement: &Movement,
        pending: &LedgerEntry,
        record: &IdempotencyRecord,
    ) -> StoreResult<LedgerEntry> {
        let max_attempts = self.config.max_commit_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_commit(movement, pending.clone(), record).await {
                Ok(entry) => return Ok(entry),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry_backoff * attempt;
                    tracing::warn!(
                        entry_id = %pending.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Atomic scope conflict, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_commit(
        &self,
        movement: &Movement,
        pending: LedgerEntry,
        record: &IdempotencyRecord,
    ) -> StoreResult<LedgerEntry> {
        let mut scope = self.storage.begin().await?;

        let applied = apply_movement(scope.as_mut(), movement, pending, record).await;
        match applied {
            Ok(entry) => {
                scope.commit().await?;
                Ok(entry)
            }
            Err(e) => {
                if let Err(rollback_error) = scope.rollback().await {
                    tracing::warn!(error = %rollback_error, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Best-effort FAILED audit entry, written outside the rolled-back scope
    async fn record_failure(&self, pending: LedgerEntry, error: &EngineError) {
        let entry = pending.failed(error.to_string());
        if let Err(e) = self.storage.append_entry(&entry).await {
            tracing::warn!(
                entry_id = %entry.id,
                reason = error.reason(),
                error = %e,
                "Failed to record failed ledger entry"
            );
        }
    }
}

/// Static checks made at RECEIVED, before anything is read or reserved.
/// Returns the amount and the idempotency key to use.
fn check_request(
    actor: &Actor,
    request: &OperationRequest,
) -> Result<(Amount, String), ValidationError> {
    let amount = Amount::new(request.amount)?;

    if !request.kind.permits(actor.role) {
        return Err(ValidationError::unauthorized(actor.role, request.kind));
    }
    match (request.kind.requires_destination(), &request.destination) {
        (true, None) => return Err(ValidationError::MissingDestination(request.kind)),
        (false, Some(_)) => return Err(ValidationError::UnexpectedDestination(request.kind)),
        _ => {}
    }

    let key = match &request.idempotency_key {
        Some(key) => {
            idempotency::validate_key(key)?;
            key.clone()
        }
        None => {
            let nonce = request
                .nonce
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            idempotency::derive_key(actor, request.kind, &nonce)
        }
    };

    Ok((amount, key))
}

/// Body of the atomic scope: lock, debit, credit, append, complete
async fn apply_movement(
    scope: &mut dyn AtomicScope,
    movement: &Movement,
    pending: LedgerEntry,
    record: &IdempotencyRecord,
) -> StoreResult<LedgerEntry> {
    let accounts = scope.lock_accounts(&movement.lock_order()).await?;

    if let Some(inactive) = accounts.iter().find(|account| !account.is_active()) {
        return Err(StoreError::AccountInactive {
            account_id: inactive.id,
            status: inactive.status,
        });
    }
    let version_of = |account_id: Uuid| {
        accounts
            .iter()
            .find(|account| account.id == account_id)
            .map(|account| account.version)
            .ok_or(StoreError::AccountNotFound(account_id))
    };

    let amount = pending.amount.minor_units();

    let source_after = match movement.source() {
        Some(source) => Some(scope.adjust(source, -amount, version_of(source)?).await?.balance),
        None => None,
    };
    let destination_after = match movement.destination() {
        Some(destination) => Some(
            scope
                .adjust(destination, amount, version_of(destination)?)
                .await?
                .balance,
        ),
        None => None,
    };

    let entry = pending.committed(source_after, destination_after);
    scope.append(&entry).await?;
    scope
        .complete_idempotency(&record.key, record.reservation_id, entry.id)
        .await?;

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;

    #[test]
    fn test_check_request_rejects_bad_amounts() {
        let actor = Actor::user(Uuid::new_v4());

        for amount in [0, -100] {
            let err = check_request(&actor, &OperationRequest::deposit(amount)).unwrap_err();
            assert!(matches!(err, ValidationError::InvalidAmount(_)));
        }
    }

    #[test]
    fn test_check_request_capabilities() {
        let user = Actor::user(Uuid::new_v4());
        let request = OperationRequest::new(OperationKind::AgentCashOut, 100)
            .with_destination(AccountRef::Handle("01700000000".into()));

        assert_eq!(
            check_request(&user, &request).unwrap_err(),
            ValidationError::unauthorized(Role::User, OperationKind::AgentCashOut)
        );
        assert!(check_request(&Actor::agent(Uuid::new_v4()), &request).is_ok());

        let admin = Actor::new(Uuid::new_v4(), Role::Admin);
        assert!(check_request(&admin, &OperationRequest::deposit(100)).is_err());
    }

    #[test]
    fn test_check_request_destination_shape() {
        let actor = Actor::user(Uuid::new_v4());

        let missing = OperationRequest::new(OperationKind::Transfer, 100);
        assert_eq!(
            check_request(&actor, &missing).unwrap_err(),
            ValidationError::MissingDestination(OperationKind::Transfer)
        );

        let unexpected = OperationRequest::withdraw(100).with_destination(AccountRef::Id(Uuid::new_v4()));
        assert_eq!(
            check_request(&actor, &unexpected).unwrap_err(),
            ValidationError::UnexpectedDestination(OperationKind::Withdraw)
        );
    }

    #[test]
    fn test_check_request_keys() {
        let actor = Actor::user(Uuid::new_v4());

        let (_, key) =
            check_request(&actor, &OperationRequest::deposit(100).with_idempotency_key("abc"))
                .unwrap();
        assert_eq!(key, "abc");

        let with_nonce = OperationRequest::deposit(100).with_nonce("n1");
        let (_, first) = check_request(&actor, &with_nonce).unwrap();
        let (_, second) = check_request(&actor, &with_nonce).unwrap();
        assert_eq!(first, second);

        // No key and no nonce: every submission is distinct
        let (_, a) = check_request(&actor, &OperationRequest::deposit(100)).unwrap();
        let (_, b) = check_request(&actor, &OperationRequest::deposit(100)).unwrap();
        assert_ne!(a, b);

        let blank = OperationRequest::deposit(100).with_idempotency_key("");
        assert!(matches!(
            check_request(&actor, &blank),
            Err(ValidationError::InvalidIdempotencyKey(_))
        ));
    }
}

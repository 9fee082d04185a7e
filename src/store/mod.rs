//! Storage module
//!
//! Account, ledger and idempotency storage behind one handle. The handle is
//! built once by the process bootstrap and passed explicitly to every
//! service as `Arc<dyn Storage>`.
//!
//! Balance mutation happens only inside an [`AtomicScope`]: everything done
//! through a scope becomes visible together on `commit` or not at all.

mod error;
pub mod memory;
pub mod postgres;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Account, AccountStatus, Balance, HistoryQuery, LedgerEntry, Page};
use crate::idempotency::{IdempotencyRecord, ReserveOutcome};

/// Result of a successful `adjust`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjusted {
    pub balance: Balance,
    pub version: i64,
}

/// Accounts and committed entries read under one consistent snapshot
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub accounts: Vec<Account>,
    pub entries: Vec<LedgerEntry>,
}

/// One unit of work. Dropping a scope without `commit` discards it.
#[async_trait]
pub trait AtomicScope: Send {
    /// Take the exclusive mutation right on each account, in ascending id
    /// order, and return their current state.
    async fn lock_accounts(&mut self, ids: &[Uuid]) -> StoreResult<Vec<Account>>;

    /// Apply a signed delta if the account is still at `expected_version`.
    /// A negative resulting balance fails with `InsufficientFunds` and
    /// leaves the account untouched.
    async fn adjust(
        &mut self,
        account_id: Uuid,
        delta: i64,
        expected_version: i64,
    ) -> StoreResult<Adjusted>;

    async fn insert_account(&mut self, account: &Account) -> StoreResult<()>;

    /// Append a ledger entry as part of this scope
    async fn append(&mut self, entry: &LedgerEntry) -> StoreResult<Uuid>;

    /// Mark the caller's reservation COMPLETED. Fails with
    /// `DuplicateIdempotencyKey` if the reservation is no longer pending.
    async fn complete_idempotency(
        &mut self,
        key: &str,
        reservation_id: Uuid,
        ledger_entry_id: Uuid,
    ) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<Account>>;

    async fn find_account_by_handle(&self, handle: &str) -> StoreResult<Option<Account>>;

    async fn find_account_by_owner(&self, owner_id: Uuid) -> StoreResult<Option<Account>>;

    async fn get_balance(&self, account_id: Uuid) -> StoreResult<Balance> {
        self.get_account(account_id)
            .await?
            .map(|account| account.balance)
            .ok_or(StoreError::AccountNotFound(account_id))
    }

    /// Administrative flagging, applied only while the account is still in
    /// `expected`. Waits for any scope holding the account.
    async fn set_account_status(
        &self,
        account_id: Uuid,
        expected: AccountStatus,
        status: AccountStatus,
    ) -> StoreResult<Account>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append outside any scope (FAILED audit entries)
    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<Uuid>;

    async fn get_entry(&self, entry_id: Uuid) -> StoreResult<Option<LedgerEntry>>;

    /// Most recent COMMITTED entry recorded under `key`
    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<LedgerEntry>>;

    /// Entries touching `account_id`, newest first
    async fn list_by_account(
        &self,
        account_id: Uuid,
        query: &HistoryQuery,
    ) -> StoreResult<Page<LedgerEntry>>;

    /// All accounts and COMMITTED entries (sequence order) at one instant
    async fn ledger_snapshot(&self) -> StoreResult<LedgerSnapshot>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert `record` unless a non-expired record holds the key
    async fn reserve(&self, record: &IdempotencyRecord) -> StoreResult<ReserveOutcome>;

    async fn get_idempotency(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>>;

    /// Drop a PENDING reservation so the client may retry
    async fn release(&self, key: &str, reservation_id: Uuid) -> StoreResult<bool>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Drop PENDING reservations created before `cutoff`
    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait Storage: AccountStore + LedgerStore + IdempotencyStore {
    async fn begin(&self) -> StoreResult<Box<dyn AtomicScope>>;

    async fn health_check(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}

//! In-memory storage backend
//!
//! Same atomic-scope semantics as the Postgres backend, for tests and local
//! runs. Each account has its own async mutex (acquired in id order by
//! `lock_accounts`); a scope stages its writes privately and publishes them
//! under a single write lock on commit, so readers never see half of an
//! operation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    AccountStore, Adjusted, AtomicScope, IdempotencyStore, LedgerSnapshot, LedgerStore, Storage,
    StoreError, StoreResult,
};
use crate::domain::{
    Account, AccountStatus, AmountError, EntryStatus, HistoryQuery, LedgerEntry, Page,
};
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus, ReserveOutcome};

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    handles: HashMap<String, Uuid>,
    owners: HashMap<Uuid, Uuid>,
    ledger: Vec<LedgerEntry>,
    entry_index: HashMap<Uuid, usize>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

impl MemoryState {
    fn check_new_account(&self, account: &Account) -> StoreResult<()> {
        if self.accounts.contains_key(&account.id) {
            return Err(StoreError::DuplicateAccount(account.id.to_string()));
        }
        if self.owners.contains_key(&account.owner_id) {
            return Err(StoreError::DuplicateAccount(format!(
                "owner {}",
                account.owner_id
            )));
        }
        if self.handles.contains_key(&account.handle) {
            return Err(StoreError::DuplicateAccount(format!(
                "handle {}",
                account.handle
            )));
        }
        Ok(())
    }

    fn insert_account(&mut self, account: Account) {
        self.handles.insert(account.handle.clone(), account.id);
        self.owners.insert(account.owner_id, account.id);
        self.accounts.insert(account.id, account);
    }

    fn push_entry(&mut self, mut entry: LedgerEntry) -> StoreResult<Uuid> {
        if self.entry_index.contains_key(&entry.id) {
            return Err(StoreError::Backend(format!(
                "ledger entry {} already appended",
                entry.id
            )));
        }
        entry.sequence = self.ledger.len() as i64 + 1;
        let id = entry.id;
        self.entry_index.insert(id, self.ledger.len());
        self.ledger.push(entry);
        Ok(id)
    }

    fn pending_reservation(&self, key: &str, reservation_id: Uuid) -> bool {
        self.idempotency.get(key).is_some_and(|record| {
            record.reservation_id == reservation_id && record.status == IdempotencyStatus::Pending
        })
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: RwLock<MemoryState>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Shared {
    async fn lock_account(&self, account_id: Uuid) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(account_id).or_default().clone();
        mutex.lock_owned().await
    }
}

/// Process-local storage handle. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    shared: Arc<Shared>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Staged unit of work over [`MemoryStorage`]
pub struct MemoryScope {
    shared: Arc<Shared>,
    guards: HashMap<Uuid, OwnedMutexGuard<()>>,
    /// Adjusted or inserted accounts, written back on commit
    working: HashMap<Uuid, Account>,
    inserted: Vec<Uuid>,
    entries: Vec<LedgerEntry>,
    completions: Vec<(String, Uuid, Uuid)>,
}

impl MemoryScope {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            guards: HashMap::new(),
            working: HashMap::new(),
            inserted: Vec::new(),
            entries: Vec::new(),
            completions: Vec::new(),
        }
    }

    async fn ensure_locked(&mut self, account_id: Uuid) {
        if self.guards.contains_key(&account_id) || self.inserted.contains(&account_id) {
            return;
        }
        let guard = self.shared.lock_account(account_id).await;
        self.guards.insert(account_id, guard);
    }

    fn current(&self, account_id: Uuid) -> StoreResult<Account> {
        if let Some(account) = self.working.get(&account_id) {
            return Ok(account.clone());
        }
        self.shared
            .state
            .read()
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or(StoreError::AccountNotFound(account_id))
    }
}

#[async_trait]
impl AtomicScope for MemoryScope {
    async fn lock_accounts(&mut self, ids: &[Uuid]) -> StoreResult<Vec<Account>> {
        let mut ordered = ids.to_vec();
        ordered.sort();
        ordered.dedup();

        for id in &ordered {
            self.ensure_locked(*id).await;
        }

        ordered.into_iter().map(|id| self.current(id)).collect()
    }

    async fn adjust(
        &mut self,
        account_id: Uuid,
        delta: i64,
        expected_version: i64,
    ) -> StoreResult<Adjusted> {
        self.ensure_locked(account_id).await;
        let mut account = self.current(account_id)?;

        if account.version != expected_version {
            return Err(StoreError::VersionConflict {
                account_id,
                expected: expected_version,
                found: account.version,
            });
        }

        account.balance = account.balance.apply_delta(delta).map_err(|e| match e {
            AmountError::Negative(_) => StoreError::InsufficientFunds {
                account_id,
                required: delta.saturating_neg(),
                available: account.balance.minor_units(),
            },
            other => StoreError::Backend(other.to_string()),
        })?;
        account.version += 1;
        account.updated_at = Utc::now();

        let adjusted = Adjusted {
            balance: account.balance,
            version: account.version,
        };
        self.working.insert(account_id, account);
        Ok(adjusted)
    }

    async fn insert_account(&mut self, account: &Account) -> StoreResult<()> {
        self.shared.state.read().check_new_account(account)?;
        let clashes = self.inserted.iter().filter_map(|id| self.working.get(id)).any(|staged| {
            staged.owner_id == account.owner_id || staged.handle == account.handle
        });
        if clashes {
            return Err(StoreError::DuplicateAccount(account.handle.clone()));
        }

        self.inserted.push(account.id);
        self.working.insert(account.id, account.clone());
        Ok(())
    }

    async fn append(&mut self, entry: &LedgerEntry) -> StoreResult<Uuid> {
        self.entries.push(entry.clone());
        Ok(entry.id)
    }

    async fn complete_idempotency(
        &mut self,
        key: &str,
        reservation_id: Uuid,
        ledger_entry_id: Uuid,
    ) -> StoreResult<()> {
        if !self.shared.state.read().pending_reservation(key, reservation_id) {
            return Err(StoreError::DuplicateIdempotencyKey(key.to_string()));
        }
        self.completions
            .push((key.to_string(), reservation_id, ledger_entry_id));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryScope {
            shared,
            guards,
            mut working,
            inserted,
            entries,
            completions,
        } = *self;

        {
            let mut state = shared.state.write();

            for id in &inserted {
                if let Some(account) = working.get(id) {
                    state.check_new_account(account)?;
                }
            }
            for (key, reservation_id, _) in &completions {
                if !state.pending_reservation(key, *reservation_id) {
                    return Err(StoreError::DuplicateIdempotencyKey(key.clone()));
                }
            }
            if let Some(entry) = entries.iter().find(|e| state.entry_index.contains_key(&e.id)) {
                return Err(StoreError::Backend(format!(
                    "ledger entry {} already appended",
                    entry.id
                )));
            }

            for id in &inserted {
                if let Some(account) = working.remove(id) {
                    state.insert_account(account);
                }
            }
            for (id, account) in working {
                state.accounts.insert(id, account);
            }
            for entry in entries {
                state.push_entry(entry)?;
            }
            for (key, _, ledger_entry_id) in completions {
                if let Some(record) = state.idempotency.get_mut(&key) {
                    record.status = IdempotencyStatus::Completed;
                    record.ledger_entry_id = Some(ledger_entry_id);
                }
            }
        }

        drop(guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStorage {
    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.shared.state.read().accounts.get(&account_id).cloned())
    }

    async fn find_account_by_handle(&self, handle: &str) -> StoreResult<Option<Account>> {
        let state = self.shared.state.read();
        Ok(state
            .handles
            .get(handle)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn find_account_by_owner(&self, owner_id: Uuid) -> StoreResult<Option<Account>> {
        let state = self.shared.state.read();
        Ok(state
            .owners
            .get(&owner_id)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn set_account_status(
        &self,
        account_id: Uuid,
        expected: AccountStatus,
        status: AccountStatus,
    ) -> StoreResult<Account> {
        let _guard = self.shared.lock_account(account_id).await;

        let mut state = self.shared.state.write();
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::AccountNotFound(account_id))?;
        if account.status != expected {
            return Err(StoreError::StatusConflict {
                account_id,
                found: account.status,
                requested: status,
            });
        }
        account.status = status;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }
}

#[async_trait]
impl LedgerStore for MemoryStorage {
    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<Uuid> {
        self.shared.state.write().push_entry(entry.clone())
    }

    async fn get_entry(&self, entry_id: Uuid) -> StoreResult<Option<LedgerEntry>> {
        let state = self.shared.state.read();
        Ok(state
            .entry_index
            .get(&entry_id)
            .and_then(|index| state.ledger.get(*index))
            .cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<LedgerEntry>> {
        let state = self.shared.state.read();
        Ok(state
            .ledger
            .iter()
            .rev()
            .find(|entry| entry.idempotency_key == key && entry.status == EntryStatus::Committed)
            .cloned())
    }

    async fn list_by_account(
        &self,
        account_id: Uuid,
        query: &HistoryQuery,
    ) -> StoreResult<Page<LedgerEntry>> {
        let query = query.clone().normalized();
        let state = self.shared.state.read();

        let matching: Vec<&LedgerEntry> = state
            .ledger
            .iter()
            .rev()
            .filter(|entry| entry.touches(account_id) && query.matches(entry))
            .collect();

        let items = matching
            .iter()
            .skip(query.offset() as usize)
            .take(query.page_size as usize)
            .map(|entry| (*entry).clone())
            .collect();

        Ok(Page {
            items,
            page: query.page,
            page_size: query.page_size,
            total: matching.len() as u64,
        })
    }

    async fn ledger_snapshot(&self) -> StoreResult<LedgerSnapshot> {
        let state = self.shared.state.read();
        Ok(LedgerSnapshot {
            accounts: state.accounts.values().cloned().collect(),
            entries: state
                .ledger
                .iter()
                .filter(|entry| entry.is_committed())
                .cloned()
                .collect(),
        })
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStorage {
    async fn reserve(&self, record: &IdempotencyRecord) -> StoreResult<ReserveOutcome> {
        let now = Utc::now();
        let mut state = self.shared.state.write();

        if let Some(existing) = state.idempotency.get(&record.key) {
            if !existing.is_expired_at(now) {
                return Ok(ReserveOutcome::Existing(existing.clone()));
            }
        }
        state.idempotency.insert(record.key.clone(), record.clone());
        Ok(ReserveOutcome::Acquired)
    }

    async fn get_idempotency(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        Ok(self.shared.state.read().idempotency.get(key).cloned())
    }

    async fn release(&self, key: &str, reservation_id: Uuid) -> StoreResult<bool> {
        let mut state = self.shared.state.write();
        if state.pending_reservation(key, reservation_id) {
            state.idempotency.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.shared.state.write();
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| !record.is_expired_at(now));
        Ok((before - state.idempotency.len()) as u64)
    }

    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.shared.state.write();
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| {
            record.status != IdempotencyStatus::Pending || record.created_at >= cutoff
        });
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> StoreResult<Box<dyn AtomicScope>> {
        Ok(Box::new(MemoryScope::new(self.shared.clone())))
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

//! Query Service
//!
//! Reads never take account locks; they see committed state only.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{Account, Balance, HistoryQuery, LedgerEntry, Page};
use crate::store::{AccountStore, LedgerStore, Storage, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Ledger entry not found: {0}")]
    EntryNotFound(Uuid),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Stored balance that disagrees with the ledger replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceMismatch {
    pub account_id: Uuid,
    pub stored: i64,
    pub replayed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub accounts_checked: usize,
    pub entries_replayed: usize,
    /// Sum of all stored balances
    pub total_balance: i64,
    pub mismatches: Vec<BalanceMismatch>,
    /// Committed entries whose replay drove an account below zero
    pub overdrawn_entries: Vec<Uuid>,
    /// Committed entries referencing an account that does not exist
    pub orphan_entries: Vec<Uuid>,
    pub checked_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
            && self.overdrawn_entries.is_empty()
            && self.orphan_entries.is_empty()
    }
}

#[derive(Clone)]
pub struct QueryService {
    storage: Arc<dyn Storage>,
}

impl QueryService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn get_account(&self, account_id: Uuid) -> Result<Account, QueryError> {
        self.storage
            .get_account(account_id)
            .await?
            .ok_or(QueryError::AccountNotFound(account_id))
    }

    pub async fn get_balance(&self, account_id: Uuid) -> Result<Balance, QueryError> {
        match self.storage.get_balance(account_id).await {
            Ok(balance) => Ok(balance),
            Err(StoreError::AccountNotFound(id)) => Err(QueryError::AccountNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Paginated entries touching `account_id`, newest first
    pub async fn get_history(
        &self,
        account_id: Uuid,
        query: HistoryQuery,
    ) -> Result<Page<LedgerEntry>, QueryError> {
        self.get_account(account_id).await?;
        let query = query.normalized();
        Ok(self.storage.list_by_account(account_id, &query).await?)
    }

    pub async fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry, QueryError> {
        self.storage
            .get_entry(entry_id)
            .await?
            .ok_or(QueryError::EntryNotFound(entry_id))
    }

    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerEntry>, QueryError> {
        Ok(self.storage.find_by_idempotency_key(key).await?)
    }

    /// Replay every COMMITTED entry from zero and compare with the stored
    /// balances, all read under one snapshot.
    pub async fn verify_ledger(&self) -> Result<ReconciliationReport, QueryError> {
        let snapshot = self.storage.ledger_snapshot().await?;
        let report = reconcile(&snapshot.accounts, &snapshot.entries);

        if report.is_consistent() {
            tracing::debug!(
                accounts = report.accounts_checked,
                entries = report.entries_replayed,
                "Ledger reconciled"
            );
        } else {
            tracing::error!(
                mismatches = report.mismatches.len(),
                overdrawn = report.overdrawn_entries.len(),
                orphans = report.orphan_entries.len(),
                "Ledger does not reconcile"
            );
        }
        Ok(report)
    }
}

fn reconcile(accounts: &[Account], entries: &[LedgerEntry]) -> ReconciliationReport {
    let mut replayed: HashMap<Uuid, i64> = accounts.iter().map(|a| (a.id, 0)).collect();
    let mut overdrawn_entries = Vec::new();
    let mut orphan_entries = Vec::new();
    let mut entries_replayed = 0;

    for entry in entries.iter().filter(|e| e.is_committed()) {
        entries_replayed += 1;
        let legs = entry
            .source_account_id
            .into_iter()
            .chain(entry.destination_account_id);

        for account_id in legs {
            match replayed.get_mut(&account_id) {
                Some(balance) => {
                    *balance += entry.delta_for(account_id);
                    if *balance < 0 && !overdrawn_entries.contains(&entry.id) {
                        overdrawn_entries.push(entry.id);
                    }
                }
                None => {
                    if !orphan_entries.contains(&entry.id) {
                        orphan_entries.push(entry.id);
                    }
                }
            }
        }
    }

    let mismatches = accounts
        .iter()
        .filter_map(|account| {
            let stored = account.balance.minor_units();
            let replayed = replayed.get(&account.id).copied().unwrap_or_default();
            (stored != replayed).then_some(BalanceMismatch {
                account_id: account.id,
                stored,
                replayed,
            })
        })
        .collect();

    ReconciliationReport {
        accounts_checked: accounts.len(),
        entries_replayed,
        total_balance: accounts.iter().map(|a| a.balance.minor_units()).sum(),
        mismatches,
        overdrawn_entries,
        orphan_entries,
        checked_at: Utc::now(),
    }
}

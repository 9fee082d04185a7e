//! Ledger entries
//!
//! Append-only records of every balance-affecting event, plus the
//! pagination types used to read them back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::amount::{Amount, Balance};
use super::operation::{Movement, OperationKind, OperationReceipt};

/// Ledger entry status. Only terminal states are ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Committed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Committed => "COMMITTED",
            EntryStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EntryStatus::Pending),
            "COMMITTED" => Ok(EntryStatus::Committed),
            "FAILED" => Ok(EntryStatus::Failed),
            other => Err(format!("Unknown entry status: {}", other)),
        }
    }
}

/// One ledger record referencing zero, one or two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// Position in the ledger, assigned on append (0 before that)
    pub sequence: i64,
    pub kind: OperationKind,
    pub source_account_id: Option<Uuid>,
    pub destination_account_id: Option<Uuid>,
    pub amount: Amount,
    pub source_balance_after: Option<Balance>,
    pub destination_balance_after: Option<Balance>,
    pub actor_account_id: Uuid,
    pub idempotency_key: String,
    pub status: EntryStatus,
    pub failure_reason: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Start an entry for an operation that has not touched any balance yet.
    pub fn pending(
        movement: &Movement,
        amount: Amount,
        actor_account_id: Uuid,
        idempotency_key: impl Into<String>,
        correlation_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            kind: movement.kind(),
            source_account_id: movement.source(),
            destination_account_id: movement.destination(),
            amount,
            source_balance_after: None,
            destination_balance_after: None,
            actor_account_id,
            idempotency_key: idempotency_key.into(),
            status: EntryStatus::Pending,
            failure_reason: None,
            correlation_id,
            created_at: Utc::now(),
        }
    }

    /// Transition to COMMITTED with the post-operation balances.
    pub fn committed(
        mut self,
        source_balance_after: Option<Balance>,
        destination_balance_after: Option<Balance>,
    ) -> Self {
        debug_assert_eq!(self.status, EntryStatus::Pending);
        self.status = EntryStatus::Committed;
        self.source_balance_after = source_balance_after;
        self.destination_balance_after = destination_balance_after;
        self.created_at = Utc::now();
        self
    }

    /// Transition to FAILED. Balance snapshots stay empty.
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        debug_assert_eq!(self.status, EntryStatus::Pending);
        self.status = EntryStatus::Failed;
        self.source_balance_after = None;
        self.destination_balance_after = None;
        self.failure_reason = Some(reason.into());
        self.created_at = Utc::now();
        self
    }

    pub fn is_committed(&self) -> bool {
        self.status == EntryStatus::Committed
    }

    pub fn touches(&self, account_id: Uuid) -> bool {
        self.source_account_id == Some(account_id) || self.destination_account_id == Some(account_id)
    }

    /// Signed balance effect of this entry on `account_id`
    pub fn delta_for(&self, account_id: Uuid) -> i64 {
        if !self.is_committed() {
            return 0;
        }
        let mut delta = 0;
        if self.source_account_id == Some(account_id) {
            delta -= self.amount.minor_units();
        }
        if self.destination_account_id == Some(account_id) {
            delta += self.amount.minor_units();
        }
        delta
    }

    /// Receipt for a committed entry, as seen by the submitting actor.
    pub fn receipt(&self) -> Option<OperationReceipt> {
        if !self.is_committed() {
            return None;
        }
        let actor = Some(self.actor_account_id);
        let new_balance = if self.source_account_id == actor {
            self.source_balance_after
        } else if self.destination_account_id == actor {
            self.destination_balance_after
        } else {
            self.destination_balance_after.or(self.source_balance_after)
        }?;

        Some(OperationReceipt {
            ledger_entry_id: self.id,
            kind: self.kind,
            amount: self.amount,
            new_balance,
        })
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// History filters and pagination (pages are 1-based).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub kinds: Vec<OperationKind>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// Include FAILED audit entries alongside COMMITTED ones
    #[serde(default)]
    pub include_failed: bool,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            kinds: Vec::new(),
            from: None,
            to: None,
            include_failed: false,
        }
    }
}

impl HistoryQuery {
    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    pub fn kinds(mut self, kinds: Vec<OperationKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn include_failed(mut self, include: bool) -> Self {
        self.include_failed = include;
        self
    }

    /// Clamp page and page size into their allowed ranges
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    /// In-memory form of the filter (the SQL form lives in the postgres store)
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if !self.include_failed && entry.status != EntryStatus::Committed {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&entry.kind) {
            return false;
        }
        if self.from.is_some_and(|from| entry.created_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| entry.created_at >= to) {
            return false;
        }
        true
    }
}

/// One page of results, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        u64::from(self.page) * u64::from(self.page_size) < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_entry(source: Uuid, destination: Uuid, amount: i64) -> LedgerEntry {
        let movement = Movement::Transfer {
            source,
            destination,
        };
        LedgerEntry::pending(&movement, Amount::new(amount).unwrap(), source, "key-1", None)
    }

    #[test]
    fn test_pending_to_committed() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let entry = transfer_entry(a, b, 40).committed(
            Some(Balance::new(60).unwrap()),
            Some(Balance::new(40).unwrap()),
        );

        assert!(entry.is_committed());
        assert_eq!(entry.delta_for(a), -40);
        assert_eq!(entry.delta_for(b), 40);
        assert_eq!(entry.delta_for(Uuid::new_v4()), 0);

        let receipt = entry.receipt().unwrap();
        assert_eq!(receipt.new_balance, Balance::new(60).unwrap());
        assert_eq!(receipt.kind, OperationKind::Transfer);
    }

    #[test]
    fn test_failed_entry_has_no_effect() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let failed = transfer_entry(a, b, 40).failed("insufficient funds");

        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("insufficient funds"));
        assert_eq!(failed.delta_for(a), 0);
        assert!(failed.receipt().is_none());
    }

    #[test]
    fn test_receipt_for_cash_in_without_float() {
        let agent = Uuid::new_v4();
        let user = Uuid::new_v4();
        let movement = Movement::AgentCashIn { float: None, user };
        let entry = LedgerEntry::pending(&movement, Amount::new(500).unwrap(), agent, "k", None)
            .committed(None, Some(Balance::new(5500).unwrap()));

        assert_eq!(entry.receipt().unwrap().new_balance.minor_units(), 5500);
    }

    #[test]
    fn test_history_query_normalized() {
        let query = HistoryQuery::default().page(0, 500).normalized();
        assert_eq!(query.page, 1);
        assert_eq!(query.page_size, MAX_PAGE_SIZE);
        assert_eq!(query.offset(), 0);

        let query = HistoryQuery::default().page(3, 10);
        assert_eq!(query.offset(), 20);
    }

    #[test]
    fn test_history_query_matches() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let committed = transfer_entry(a, b, 10).committed(None, None);
        let failed = transfer_entry(a, b, 10).failed("nope");

        let query = HistoryQuery::default();
        assert!(query.matches(&committed));
        assert!(!query.matches(&failed));
        assert!(query.clone().include_failed(true).matches(&failed));
        assert!(!query
            .kinds(vec![OperationKind::Deposit])
            .matches(&committed));
    }

    #[test]
    fn test_page_has_more() {
        let page: Page<u8> = Page {
            items: vec![],
            page: 1,
            page_size: 10,
            total: 11,
        };
        assert!(page.has_more());
    }
}

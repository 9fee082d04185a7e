//! Query module
//!
//! Read-only access to balances, history and ledger entries, plus the
//! reconciliation check that replays the ledger against stored balances.

mod service;

pub use service::{BalanceMismatch, QueryError, QueryService, ReconciliationReport};

//! Domain module
//!
//! Core domain types: money, accounts, actors, operations and ledger entries.

pub mod account;
pub mod actor;
pub mod amount;
pub mod context;
pub mod error;
pub mod ledger;
pub mod operation;

pub use account::{Account, AccountStatus};
pub use actor::{Actor, Role, UnknownRole};
pub use amount::{Amount, AmountError, Balance};
pub use context::OperationContext;
pub use error::ValidationError;
pub use ledger::{EntryStatus, HistoryQuery, LedgerEntry, Page};
pub use operation::{
    AccountRef, Movement, OperationKind, OperationReceipt, OperationRequest, UnknownKind,
};

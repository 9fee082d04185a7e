//! wallet_ledger Library
//!
//! Ledger and balance engine for a digital wallet. Re-exports modules for
//! integration testing and external use.

pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod jobs;
pub mod query;
pub mod store;

pub use config::Config;
pub use domain::{
    Account, AccountStatus, Actor, Amount, AmountError, Balance, OperationContext, OperationKind,
    OperationReceipt, OperationRequest, Role, ValidationError,
};
pub use engine::{AccountService, EngineConfig, EngineError, TransferEngine};
pub use error::{AppError, AppResult};
pub use query::QueryService;
pub use store::{MemoryStorage, PgStorage, Storage};

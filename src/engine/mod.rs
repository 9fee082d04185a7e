//! Engine module
//!
//! The only path by which balances change: money movement through the
//! [`TransferEngine`] and account opening through the [`AccountService`].

mod error;
mod onboarding;
mod state;
mod transfer;

pub use error::EngineError;
pub use onboarding::{signup_key, AccountService, MAX_HANDLE_LENGTH, SIGNUP_KEY_PREFIX};
pub use state::{OperationState, StateTracker};
pub use transfer::{
    EngineConfig, TransferEngine, DEFAULT_MAX_COMMIT_ATTEMPTS, DEFAULT_RETRY_BACKOFF,
    DEFAULT_VALIDATION_TIMEOUT,
};

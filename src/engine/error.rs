//! Engine Errors
//!
//! Every error leaving the engine is one of these variants.

use uuid::Uuid;

use crate::domain::ValidationError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Rejected before any mutation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Rejected inside the atomic scope, nothing applied
    #[error("Insufficient funds in account {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        account_id: Uuid,
        required: i64,
        available: i64,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Commit retries exhausted
    #[error("Operation abandoned after {attempts} attempts due to contention")]
    Contention { attempts: u32 },

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    /// Durable write failed; presumed not committed
    #[error("Storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    /// Whether the caller's input (or balance) is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::InsufficientFunds { .. }
                | EngineError::AccountNotFound(_)
        )
    }

    /// Whether resubmitting the same request may succeed as is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Contention { .. } | EngineError::Timeout(_) | EngineError::Storage(_)
        )
    }

    /// Stable label for logs and failed ledger entries
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::AccountNotFound(_) => "account_not_found",
            EngineError::Contention { .. } => "contention",
            EngineError::Timeout(_) => "timeout",
            EngineError::Storage(_) => "storage_failure",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AccountNotFound(id) => EngineError::AccountNotFound(id.to_string()),
            StoreError::VersionConflict { .. } => EngineError::Contention { attempts: 1 },
            StoreError::AccountInactive { account_id, status } => {
                ValidationError::account_not_active(account_id, status).into()
            }
            StoreError::StatusConflict {
                found, requested, ..
            } => ValidationError::InvalidStatusTransition {
                from: found,
                to: requested,
            }
            .into(),
            StoreError::InsufficientFunds {
                account_id,
                required,
                available,
            } => EngineError::InsufficientFunds {
                account_id,
                required,
                available,
            },
            StoreError::DuplicateIdempotencyKey(key) => {
                ValidationError::IdempotencyKeyReused(key).into()
            }
            StoreError::DuplicateAccount(what) => ValidationError::DuplicateAccount(what).into(),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountStatus, OperationKind, Role};

    #[test]
    fn test_store_error_mapping() {
        let id = Uuid::new_v4();
        let err: EngineError = StoreError::InsufficientFunds {
            account_id: id,
            required: 50,
            available: 10,
        }
        .into();
        assert!(matches!(err, EngineError::InsufficientFunds { required: 50, .. }));
        assert!(err.is_client_error());

        let err: EngineError = StoreError::Backend("connection reset".into()).into();
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(err.is_retryable());

        let err: EngineError = StoreError::AccountNotFound(id).into();
        assert_eq!(err.to_string(), format!("Account not found: {}", id));

        let err: EngineError = StoreError::StatusConflict {
            account_id: id,
            found: AccountStatus::Closed,
            requested: AccountStatus::Frozen,
        }
        .into();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::InvalidStatusTransition {
                from: AccountStatus::Closed,
                to: AccountStatus::Frozen,
            })
        ));
    }

    #[test]
    fn test_validation_is_transparent() {
        let err: EngineError =
            ValidationError::unauthorized(Role::User, OperationKind::AgentCashOut).into();
        assert_eq!(err.to_string(), "Role USER may not submit AGENT_CASH_OUT");
        assert_eq!(err.reason(), "validation");
        assert!(!err.is_retryable());
    }
}

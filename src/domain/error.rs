//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use thiserror::Error;
use uuid::Uuid;

use super::account::AccountStatus;
use super::actor::Role;
use super::amount::AmountError;
use super::operation::OperationKind;

/// Input rejected before any mutation.
///
/// Always safe to retry once the input is corrected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    /// Role missing from the capability map for this kind
    #[error("Role {role} may not submit {kind}")]
    Unauthorized { role: Role, kind: OperationKind },

    #[error("{0} requires a destination account")]
    MissingDestination(OperationKind),

    #[error("{0} does not take a destination account")]
    UnexpectedDestination(OperationKind),

    #[error("Source and destination must be different accounts")]
    SameAccount,

    #[error("Account {account_id} is {status}")]
    AccountNotActive {
        account_id: Uuid,
        status: AccountStatus,
    },

    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    /// Same key, different request body
    #[error("Idempotency key {0} was already used for a different request")]
    IdempotencyKeyReused(String),

    #[error("Account already exists for {0}")]
    DuplicateAccount(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Cannot change account status from {from} to {to}")]
    InvalidStatusTransition {
        from: AccountStatus,
        to: AccountStatus,
    },
}

impl ValidationError {
    pub fn unauthorized(role: Role, kind: OperationKind) -> Self {
        Self::Unauthorized { role, kind }
    }

    pub fn account_not_active(account_id: Uuid, status: AccountStatus) -> Self {
        Self::AccountNotActive { account_id, status }
    }

    /// Authorization failures map to 403 rather than 400
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Conflicts with existing state rather than malformed input
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::IdempotencyKeyReused(_)
                | Self::DuplicateAccount(_)
                | Self::AccountNotActive { .. }
                | Self::InvalidStatusTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_error() {
        let err = ValidationError::unauthorized(Role::User, OperationKind::AgentCashOut);

        assert!(err.is_authorization());
        assert!(!err.is_conflict());
        assert_eq!(err.to_string(), "Role USER may not submit AGENT_CASH_OUT");
    }

    #[test]
    fn test_amount_error_converts() {
        let err: ValidationError = AmountError::NotPositive(0).into();
        assert!(matches!(err, ValidationError::InvalidAmount(_)));
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_account_not_active_error() {
        let id = Uuid::new_v4();
        let err = ValidationError::account_not_active(id, AccountStatus::Frozen);

        assert!(err.is_conflict());
        assert!(err.to_string().contains("FROZEN"));
        assert!(err.to_string().contains(&id.to_string()));
    }
}

//! Store Errors
//!
//! Error types shared by every storage backend.

use uuid::Uuid;

use crate::domain::AccountStatus;

/// Errors that can occur in a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    /// Optimistic concurrency conflict on `adjust`
    #[error("Version conflict for account {account_id}: expected version {expected}, found {found}")]
    VersionConflict {
        account_id: Uuid,
        expected: i64,
        found: i64,
    },

    /// Found under lock in a status that rejects money movement
    #[error("Account {account_id} is {status}")]
    AccountInactive {
        account_id: Uuid,
        status: AccountStatus,
    },

    /// Status changed since it was read; the requested change was not applied
    #[error("Account {account_id} is {found}, cannot change to {requested}")]
    StatusConflict {
        account_id: Uuid,
        found: AccountStatus,
        requested: AccountStatus,
    },

    #[error("Insufficient funds in account {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        account_id: Uuid,
        required: i64,
        available: i64,
    },

    /// The reservation backing a commit is gone or already completed
    #[error("Idempotency key already committed or reservation lost: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("Account already exists: {0}")]
    DuplicateAccount(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored row could not be mapped back into a domain value
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// SQLSTATE codes worth retrying the whole atomic scope for
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

impl StoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }

    /// Whether re-running the atomic scope may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::VersionConflict { .. } => true,
            StoreError::Database(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
            ),
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_is_retryable() {
        let conflict = StoreError::VersionConflict {
            account_id: Uuid::nil(),
            expected: 1,
            found: 2,
        };
        assert!(conflict.is_version_conflict());
        assert!(conflict.is_retryable());

        let funds = StoreError::InsufficientFunds {
            account_id: Uuid::nil(),
            required: 50,
            available: 10,
        };
        assert!(!funds.is_retryable());
        assert!(funds.to_string().contains("required 50"));

        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StoreError::Backend("disk full".into()).is_retryable());
    }
}

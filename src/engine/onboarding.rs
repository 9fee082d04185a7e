//! Account Onboarding
//!
//! Opens wallet accounts and handles administrative status flagging.

use std::sync::Arc;

use uuid::Uuid;

use super::error::EngineError;
use crate::domain::{
    Account, AccountStatus, Amount, LedgerEntry, Movement, OperationContext, Role, ValidationError,
};
use crate::store::{AccountStore, AtomicScope, Storage, StoreResult};

pub const SIGNUP_KEY_PREFIX: &str = "signup:";
pub const MAX_HANDLE_LENGTH: usize = 64;

/// Idempotency key of the signup bonus entry for `owner_id`
pub fn signup_key(owner_id: Uuid) -> String {
    format!("{}{}", SIGNUP_KEY_PREFIX, owner_id)
}

#[derive(Clone)]
pub struct AccountService {
    storage: Arc<dyn Storage>,
    signup_bonus: Option<Amount>,
}

impl AccountService {
    pub fn new(storage: Arc<dyn Storage>, signup_bonus: Option<Amount>) -> Self {
        Self {
            storage,
            signup_bonus,
        }
    }

    /// Open the one account for `owner_id`, crediting the signup bonus as a
    /// COMMITTED DEPOSIT in the same scope.
    pub async fn open_account(
        &self,
        owner_id: Uuid,
        role: Role,
        handle: &str,
        ctx: &OperationContext,
    ) -> Result<Account, EngineError> {
        let handle = normalize_handle(handle)?;

        if self.storage.find_account_by_owner(owner_id).await?.is_some() {
            return Err(ValidationError::DuplicateAccount(format!("owner {}", owner_id)).into());
        }
        if self.storage.find_account_by_handle(&handle).await?.is_some() {
            return Err(ValidationError::DuplicateAccount(format!("handle {}", handle)).into());
        }

        let account = Account::open(owner_id, role, handle);
        let mut scope = self.storage.begin().await?;

        let staged =
            stage_account(scope.as_mut(), &account, self.signup_bonus, ctx.correlation_id).await;
        match staged {
            Ok(()) => scope.commit().await?,
            Err(e) => {
                if let Err(rollback_error) = scope.rollback().await {
                    tracing::warn!(error = %rollback_error, "Rollback failed");
                }
                return Err(e.into());
            }
        }

        let opened = self
            .storage
            .get_account(account.id)
            .await?
            .ok_or_else(|| EngineError::AccountNotFound(account.id.to_string()))?;

        tracing::info!(
            account_id = %opened.id,
            owner_id = %owner_id,
            role = %role,
            balance = opened.balance.minor_units(),
            "Account opened"
        );
        Ok(opened)
    }

    /// Flag an account ACTIVE, FROZEN or CLOSED. CLOSED is terminal.
    pub async fn set_status(
        &self,
        account_id: Uuid,
        status: AccountStatus,
    ) -> Result<Account, EngineError> {
        let current = self
            .storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| EngineError::AccountNotFound(account_id.to_string()))?;

        if !current.status.can_transition_to(status) {
            return Err(ValidationError::InvalidStatusTransition {
                from: current.status,
                to: status,
            }
            .into());
        }

        // Applied only if nobody changed the status since it was read
        let updated = self
            .storage
            .set_account_status(account_id, current.status, status)
            .await?;
        tracing::info!(
            account_id = %account_id,
            from = %current.status,
            to = %status,
            "Account status changed"
        );
        Ok(updated)
    }
}

fn normalize_handle(handle: &str) -> Result<String, ValidationError> {
    let handle = handle.trim();
    if handle.is_empty() {
        return Err(ValidationError::InvalidHandle("empty".to_string()));
    }
    if handle.len() > MAX_HANDLE_LENGTH {
        return Err(ValidationError::InvalidHandle(format!(
            "longer than {} bytes",
            MAX_HANDLE_LENGTH
        )));
    }
    if handle.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidHandle(handle.to_string()));
    }
    Ok(handle.to_string())
}

async fn stage_account(
    scope: &mut dyn AtomicScope,
    account: &Account,
    signup_bonus: Option<Amount>,
    correlation_id: Option<Uuid>,
) -> StoreResult<()> {
    scope.insert_account(account).await?;

    if let Some(bonus) = signup_bonus {
        let adjusted = scope
            .adjust(account.id, bonus.minor_units(), account.version)
            .await?;
        let movement = Movement::Deposit {
            destination: account.id,
        };
        let entry = LedgerEntry::pending(
            &movement,
            bonus,
            account.id,
            signup_key(account.owner_id),
            correlation_id,
        )
        .committed(None, Some(adjusted.balance));
        scope.append(&entry).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LedgerStore, MemoryStorage};

    fn service(bonus: i64) -> (MemoryStorage, AccountService) {
        let storage = MemoryStorage::new();
        let bonus = Amount::new(bonus).ok();
        (storage.clone(), AccountService::new(Arc::new(storage), bonus))
    }

    #[tokio::test]
    async fn test_open_account_with_bonus() {
        let (storage, service) = service(5000);
        let owner = Uuid::new_v4();

        let account = service
            .open_account(owner, Role::User, "01711111111", &OperationContext::new())
            .await
            .unwrap();
        assert_eq!(account.balance.minor_units(), 5000);
        assert_eq!(account.version, 1);

        let entry = storage
            .find_by_idempotency_key(&signup_key(owner))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.destination_account_id, Some(account.id));
        assert_eq!(entry.amount.minor_units(), 5000);
    }

    #[tokio::test]
    async fn test_open_account_without_bonus() {
        let (storage, service) = service(0);
        let account = service
            .open_account(Uuid::new_v4(), Role::Agent, "agent@example.com", &OperationContext::new())
            .await
            .unwrap();

        assert_eq!(account.balance.minor_units(), 0);
        assert!(storage.ledger_snapshot().await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_owner_and_handle() {
        let (_, service) = service(5000);
        let owner = Uuid::new_v4();
        let ctx = OperationContext::new();
        service
            .open_account(owner, Role::User, "01711111111", &ctx)
            .await
            .unwrap();

        let err = service
            .open_account(owner, Role::User, "01722222222", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DuplicateAccount(_))
        ));

        let err = service
            .open_account(Uuid::new_v4(), Role::User, " 01711111111 ", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DuplicateAccount(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_handle() {
        let (_, service) = service(5000);
        let err = service
            .open_account(Uuid::new_v4(), Role::User, "   ", &OperationContext::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::InvalidHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_set_status_transitions() {
        let (_, service) = service(0);
        let account = service
            .open_account(Uuid::new_v4(), Role::User, "u1", &OperationContext::new())
            .await
            .unwrap();

        let frozen = service
            .set_status(account.id, AccountStatus::Frozen)
            .await
            .unwrap();
        assert_eq!(frozen.status, AccountStatus::Frozen);

        service
            .set_status(account.id, AccountStatus::Closed)
            .await
            .unwrap();
        let err = service
            .set_status(account.id, AccountStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::InvalidStatusTransition { .. })
        ));

        assert!(matches!(
            service.set_status(Uuid::new_v4(), AccountStatus::Frozen).await,
            Err(EngineError::AccountNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_status_changes_never_reopen_closed() {
        let (storage, service) = service(0);

        for i in 0..50 {
            let account = service
                .open_account(
                    Uuid::new_v4(),
                    Role::User,
                    &format!("race-{}", i),
                    &OperationContext::new(),
                )
                .await
                .unwrap();

            let closer = service.clone();
            let freezer = service.clone();
            let (closed, frozen) = tokio::join!(
                tokio::spawn(async move { closer.set_status(account.id, AccountStatus::Closed).await }),
                tokio::spawn(async move { freezer.set_status(account.id, AccountStatus::Frozen).await }),
            );
            let closed = closed.unwrap();
            let frozen = frozen.unwrap();

            let status = storage.get_account(account.id).await.unwrap().unwrap().status;
            if closed.is_ok() {
                assert_eq!(status, AccountStatus::Closed);
            }
            if let Err(e) = frozen {
                assert!(matches!(
                    e,
                    EngineError::Validation(ValidationError::InvalidStatusTransition { .. })
                ));
            }
        }
    }
}

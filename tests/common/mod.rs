//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use uuid::Uuid;

use wallet_ledger::domain::{
    Account, Actor, Amount, OperationContext, OperationReceipt, OperationRequest, Role,
};
use wallet_ledger::engine::{AccountService, EngineConfig, EngineError, TransferEngine};
use wallet_ledger::query::QueryService;
use wallet_ledger::store::{MemoryStorage, Storage};

/// Engine, onboarding and queries wired to one storage handle
#[derive(Clone)]
pub struct Harness {
    pub storage: Arc<dyn Storage>,
    pub engine: TransferEngine,
    pub accounts: AccountService,
    pub query: QueryService,
}

impl Harness {
    pub fn new(storage: Arc<dyn Storage>, config: EngineConfig) -> Self {
        Self {
            engine: TransferEngine::new(storage.clone(), config),
            accounts: AccountService::new(storage.clone(), None),
            query: QueryService::new(storage.clone()),
            storage,
        }
    }

    /// Open an account with no signup bonus
    pub async fn open(&self, role: Role, handle: &str) -> Account {
        self.accounts
            .open_account(Uuid::new_v4(), role, handle, &OperationContext::new())
            .await
            .expect("open account")
    }

    /// Open an account and deposit `minor_units` into it
    pub async fn open_funded(&self, role: Role, handle: &str, minor_units: i64) -> Account {
        let account = self.open(role, handle).await;
        if minor_units > 0 {
            self.execute(actor(&account), OperationRequest::deposit(minor_units))
                .await
                .expect("initial deposit");
        }
        account
    }

    pub async fn execute(
        &self,
        actor: Actor,
        request: OperationRequest,
    ) -> Result<OperationReceipt, EngineError> {
        self.engine
            .execute(&actor, request, &OperationContext::new())
            .await
    }

    pub async fn balance(&self, account: &Account) -> i64 {
        self.query
            .get_balance(account.id)
            .await
            .expect("balance")
            .minor_units()
    }
}

/// In-memory harness with default engine settings
pub fn memory_harness() -> Harness {
    memory_harness_with(EngineConfig::default())
}

pub fn memory_harness_with(config: EngineConfig) -> Harness {
    Harness::new(Arc::new(MemoryStorage::new()), config)
}

pub fn actor(account: &Account) -> Actor {
    Actor::new(account.id, account.owner_role)
}

pub fn amount(minor_units: i64) -> Amount {
    Amount::new(minor_units).expect("positive amount")
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_backoff: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

/// Connect to the test database and empty it, or `None` when
/// DATABASE_URL is unset so postgres suites are skipped.
pub async fn setup_test_db() -> Option<PgPool> {
    dotenvy::dotenv().ok();
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL not set; skipping postgres test");
            return None;
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    // Plain string: sent as one simple query so every statement runs
    pool.execute(include_str!("../../migrations/0001_wallet_ledger.sql"))
        .await
        .expect("Failed to apply migrations");

    sqlx::query("TRUNCATE TABLE ledger_entries, idempotency_keys, accounts CASCADE")
        .execute(&pool)
        .await
        .expect("Failed to clean up DB");

    Some(pool)
}

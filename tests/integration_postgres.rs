//! PostgreSQL backend tests. Skipped unless DATABASE_URL is set.
//!
//! Everything runs in one test so the schema setup and truncation do not
//! race between parallel tests.

use std::sync::Arc;

use wallet_ledger::db;
use wallet_ledger::domain::{AccountStatus, HistoryQuery, OperationRequest, Role};
use wallet_ledger::engine::EngineError;
use wallet_ledger::jobs::JobScheduler;
use wallet_ledger::store::{IdempotencyStore, PgStorage, Storage};

mod common;

use common::{actor, fast_config, Harness};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_backend() {
    let Some(pool) = common::setup_test_db().await else {
        return;
    };
    assert!(db::check_schema(&pool).await.unwrap());

    let storage = PgStorage::new(pool.clone());
    storage.health_check().await.unwrap();
    let h = Harness::new(Arc::new(storage.clone()), fast_config());

    let alice = h.open_funded(Role::User, "pg-alice", 10_000).await;
    let bob = h.open(Role::User, "pg-bob").await;

    // Transfer and replay
    let request = OperationRequest::transfer(bob.id, 4_000).with_idempotency_key("pg-t1");
    let first = h.execute(actor(&alice), request.clone()).await.unwrap();
    let second = h.execute(actor(&alice), request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.balance(&alice).await, 6_000);
    assert_eq!(h.balance(&bob).await, 4_000);

    // Overdraft leaves balances alone and records a FAILED entry
    let err = h
        .execute(actor(&bob), OperationRequest::withdraw(9_000))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    let history = h
        .query
        .get_history(bob.id, HistoryQuery::default().include_failed(true))
        .await
        .unwrap();
    assert_eq!(history.total, 2);

    // Two concurrent withdrawals of 60 from 100: one wins
    let carol = h.open_funded(Role::User, "pg-carol", 100).await;
    let mut handles = Vec::new();
    for _ in 0..2 {
        let h = h.clone();
        let actor = actor(&carol);
        handles.push(tokio::spawn(async move {
            h.execute(actor, OperationRequest::withdraw(60)).await
        }));
    }
    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(h.balance(&carol).await, 40);

    // Duplicate onboarding is rejected by the unique constraints
    let err = h
        .accounts
        .open_account(
            uuid::Uuid::new_v4(),
            Role::User,
            "pg-alice",
            &Default::default(),
        )
        .await
        .unwrap_err();
    assert!(err.is_client_error());

    // Frozen accounts cannot move money
    h.accounts
        .set_status(bob.id, AccountStatus::Frozen)
        .await
        .unwrap();
    assert!(h
        .execute(actor(&alice), OperationRequest::transfer(bob.id, 100))
        .await
        .is_err());

    // Ledger replays to the stored balances
    let report = h.query.verify_ledger().await.unwrap();
    assert!(report.is_consistent(), "{:?}", report.mismatches);

    // Ledger rows cannot be rewritten
    let tampered = sqlx::query("UPDATE ledger_entries SET amount = 1")
        .execute(&pool)
        .await;
    assert!(tampered.is_err());

    let report = JobScheduler::new(Arc::new(storage.clone())).run_all_once().await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(storage.get_idempotency("pg-t1").await.unwrap().is_some());
}

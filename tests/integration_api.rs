//! API Integration Tests over the in-memory backend

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use wallet_ledger::api::{self, AppState};
use wallet_ledger::engine::EngineConfig;
use wallet_ledger::store::MemoryStorage;

mod common;

fn app() -> Router {
    let state = AppState::new(
        Arc::new(MemoryStorage::new()),
        EngineConfig::default(),
        Some(common::amount(5_000)),
    );
    api::build_router(state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post_json(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
}

async fn open_account(app: &Router, role: &str, handle: &str) -> (Uuid, Value) {
    let body = json!({ "owner_id": Uuid::new_v4(), "role": role, "handle": handle });
    let request = post_json("/api/v1/accounts")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, json) = send(app, request).await;
    assert_eq!(status, StatusCode::CREATED, "account creation failed: {}", json);

    let id = json["id"].as_str().unwrap().parse().unwrap();
    (id, json)
}

fn as_actor(
    builder: axum::http::request::Builder,
    account_id: Uuid,
    role: &str,
) -> axum::http::request::Builder {
    builder
        .header("X-Actor-Id", account_id.to_string())
        .header("X-Actor-Role", role)
}

fn get(uri: &str, account_id: Uuid, role: &str) -> Request<Body> {
    as_actor(Request::builder().method("GET").uri(uri), account_id, role)
        .body(Body::empty())
        .unwrap()
}

fn submit(account_id: Uuid, role: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = as_actor(post_json("/api/v1/operations"), account_id, role);
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_transfer_e2e() {
    let app = app();

    let (alice, opened) = open_account(&app, "USER", "01711111111").await;
    assert_eq!(opened["balance"], "50.00");
    assert_eq!(opened["status"], "ACTIVE");
    let (bob, _) = open_account(&app, "USER", "bob@example.com").await;

    let body = json!({
        "kind": "TRANSFER",
        "amount": "20.00",
        "destination_handle": "bob@example.com"
    });
    let (status, first) = send(&app, submit(alice, "USER", Some("pay-1"), body.clone())).await;
    assert_eq!(status, StatusCode::CREATED, "transfer failed: {}", first);
    assert_eq!(first["new_balance"], "30.00");
    assert_eq!(first["kind"], "TRANSFER");

    // Retrying with the same key replays the first receipt
    let (status, second) = send(&app, submit(alice, "USER", Some("pay-1"), body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first, second);

    let (status, json) = send(
        &app,
        get(&format!("/api/v1/accounts/{}/balance", alice), alice, "USER"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["balance"], "30.00");

    let (_, json) = send(
        &app,
        get(&format!("/api/v1/accounts/{}/balance", bob), bob, "USER"),
    )
    .await;
    assert_eq!(json["balance"], "70.00");

    // Signup bonus plus the transfer
    let (status, json) = send(
        &app,
        get(&format!("/api/v1/accounts/{}/history", bob), bob, "USER"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 2);
    assert_eq!(json["entries"][0]["kind"], "TRANSFER");
    assert_eq!(json["entries"][1]["kind"], "DEPOSIT");

    let entry_id = first["ledger_entry_id"].as_str().unwrap();
    let (status, json) = send(
        &app,
        get(&format!("/api/v1/ledger/entries/{}", entry_id), bob, "USER"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "COMMITTED");
    assert_eq!(json["amount"], "20.00");
}

#[tokio::test]
async fn test_missing_actor_is_rejected() {
    let app = app();
    let request = Request::builder()
        .method("GET")
        .uri(format!("/api/v1/accounts/{}/balance", Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();

    let (status, json) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error_code"], "unauthenticated");
}

#[tokio::test]
async fn test_cross_account_reads_are_forbidden() {
    let app = app();
    let (alice, _) = open_account(&app, "USER", "alice").await;
    let (bob, _) = open_account(&app, "USER", "bob").await;
    let (admin, _) = open_account(&app, "ADMIN", "admin").await;

    let uri = format!("/api/v1/accounts/{}/balance", alice);
    let (status, json) = send(&app, get(&uri, bob, "USER")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error_code"], "forbidden");

    let (status, _) = send(&app, get(&uri, admin, "ADMIN")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_operation_rejections() {
    let app = app();
    let (alice, _) = open_account(&app, "USER", "alice").await;
    let (bob, _) = open_account(&app, "USER", "bob").await;

    let (status, json) = send(
        &app,
        submit(alice, "USER", None, json!({ "kind": "DEPOSIT", "amount": "0.00" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "invalid_amount");

    let (status, json) = send(
        &app,
        submit(
            alice,
            "USER",
            None,
            json!({ "kind": "AGENT_CASH_OUT", "amount": "5.00", "destination_account_id": bob }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error_code"], "unauthorized_operation");

    let (status, json) = send(
        &app,
        submit(alice, "USER", None, json!({ "kind": "WITHDRAW", "amount": "500.00" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error_code"], "insufficient_funds");

    let (status, json) = send(
        &app,
        submit(
            alice,
            "USER",
            Some("same-key"),
            json!({ "kind": "DEPOSIT", "amount": "1.00", "idempotency_key": "other-key" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "invalid_request");
}

#[tokio::test]
async fn test_admin_endpoints() {
    let app = app();
    let (alice, _) = open_account(&app, "USER", "alice").await;
    let (admin, _) = open_account(&app, "ADMIN", "admin").await;

    let patch = |actor: Uuid, role: &str| {
        as_actor(
            Request::builder()
                .method("PATCH")
                .uri(format!("/api/v1/admin/accounts/{}/status", alice))
                .header("content-type", "application/json"),
            actor,
            role,
        )
        .body(Body::from(json!({ "status": "FROZEN" }).to_string()))
        .unwrap()
    };

    let (status, _) = send(&app, patch(alice, "USER")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = send(&app, patch(admin, "ADMIN")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "FROZEN");

    let (status, json) = send(
        &app,
        submit(alice, "USER", None, json!({ "kind": "DEPOSIT", "amount": "1.00" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error_code"], "account_not_active");

    let (status, json) = send(&app, get("/api/v1/admin/reconciliation", admin, "ADMIN")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["accounts_checked"], 2);
    assert_eq!(json["mismatches"], json!([]));
    assert_eq!(json["total_balance"], 10_000);
}

#[tokio::test]
async fn test_duplicate_onboarding() {
    let app = app();
    open_account(&app, "USER", "01700000000").await;

    let body = json!({ "owner_id": Uuid::new_v4(), "role": "USER", "handle": "01700000000" });
    let request = post_json("/api/v1/accounts")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, json) = send(&app, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error_code"], "duplicate_account");
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let (status, json) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["backend"], "memory");
}

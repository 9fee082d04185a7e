//! API Routes
//!
//! HTTP endpoint definitions.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    Account, AccountRef, AccountStatus, Actor, Amount, Balance, HistoryQuery, LedgerEntry,
    OperationContext, OperationKind, OperationReceipt, OperationRequest, Role,
};
use crate::engine::{AccountService, EngineConfig, TransferEngine};
use crate::error::AppError;
use crate::query::{QueryService, ReconciliationReport};
use crate::store::Storage;

use super::middleware::IDEMPOTENCY_KEY_HEADER;

/// Services shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: TransferEngine,
    pub accounts: AccountService,
    pub query: QueryService,
    pub storage: Arc<dyn Storage>,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine_config: EngineConfig,
        signup_bonus: Option<Amount>,
    ) -> Self {
        Self {
            engine: TransferEngine::new(storage.clone(), engine_config),
            accounts: AccountService::new(storage.clone(), signup_bonus),
            query: QueryService::new(storage.clone()),
            storage,
        }
    }
}

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct OpenAccountRequest {
    pub owner_id: Uuid,
    pub role: Role,
    /// Phone number or email
    pub handle: String,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub role: Role,
    pub handle: String,
    pub balance: Decimal,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            owner_id: account.owner_id,
            role: account.owner_role,
            handle: account.handle,
            balance: account.balance.to_major(),
            status: account.status,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitOperationRequest {
    pub kind: OperationKind,
    /// Major units as a decimal string, e.g. "50.25"
    pub amount: String,
    #[serde(default)]
    pub destination_account_id: Option<Uuid>,
    /// Phone number or email of the counterparty
    #[serde(default)]
    pub destination_handle: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

impl SubmitOperationRequest {
    /// Merge with the `Idempotency-Key` header into an engine request
    fn into_request(self, header_key: Option<String>) -> Result<OperationRequest, AppError> {
        let amount = Amount::from_major_str(&self.amount)
            .map_err(crate::domain::ValidationError::from)?;

        let idempotency_key = match (header_key, self.idempotency_key) {
            (Some(header), Some(body)) if header != body => {
                return Err(AppError::InvalidRequest(
                    "Idempotency-Key header and body idempotency_key differ".to_string(),
                ))
            }
            (Some(key), _) | (None, Some(key)) => Some(key),
            (None, None) => None,
        };

        let destination = match (self.destination_account_id, self.destination_handle) {
            (Some(_), Some(_)) => {
                return Err(AppError::InvalidRequest(
                    "give either destination_account_id or destination_handle".to_string(),
                ))
            }
            (Some(id), None) => Some(AccountRef::Id(id)),
            (None, Some(handle)) => Some(AccountRef::Handle(handle.trim().to_string())),
            (None, None) => None,
        };

        let mut request = OperationRequest::new(self.kind, amount.minor_units());
        request.destination = destination;
        request.idempotency_key = idempotency_key;
        request.nonce = self.nonce;
        Ok(request)
    }
}

#[derive(Debug, Serialize)]
pub struct ReceiptResponse {
    pub ledger_entry_id: Uuid,
    pub kind: OperationKind,
    pub amount: Decimal,
    pub new_balance: Decimal,
}

impl From<OperationReceipt> for ReceiptResponse {
    fn from(receipt: OperationReceipt) -> Self {
        Self {
            ledger_entry_id: receipt.ledger_entry_id,
            kind: receipt.kind,
            amount: receipt.amount.to_major(),
            new_balance: receipt.new_balance.to_major(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: Uuid,
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    /// Comma separated kinds, e.g. "DEPOSIT,TRANSFER"
    #[serde(default)]
    pub kinds: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_failed: bool,
}

impl HistoryParams {
    fn into_query(self) -> Result<HistoryQuery, AppError> {
        let defaults = HistoryQuery::default();
        let kinds = match self.kinds.as_deref() {
            None | Some("") => Vec::new(),
            Some(list) => list
                .split(',')
                .map(|kind| kind.trim().parse::<OperationKind>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::InvalidRequest(e.to_string()))?,
        };

        Ok(HistoryQuery::default()
            .page(
                self.page.unwrap_or(defaults.page),
                self.page_size.unwrap_or(defaults.page_size),
            )
            .kinds(kinds)
            .between(self.from, self.to)
            .include_failed(self.include_failed)
            .normalized())
    }
}

#[derive(Debug, Serialize)]
pub struct EntryResponse {
    pub id: Uuid,
    pub sequence: i64,
    pub kind: OperationKind,
    pub status: String,
    pub amount: Decimal,
    pub source_account_id: Option<Uuid>,
    pub destination_account_id: Option<Uuid>,
    pub source_balance_after: Option<Decimal>,
    pub destination_balance_after: Option<Decimal>,
    pub actor_account_id: Uuid,
    pub failure_reason: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for EntryResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            id: entry.id,
            sequence: entry.sequence,
            kind: entry.kind,
            status: entry.status.to_string(),
            amount: entry.amount.to_major(),
            source_account_id: entry.source_account_id,
            destination_account_id: entry.destination_account_id,
            source_balance_after: entry.source_balance_after.map(|b: Balance| b.to_major()),
            destination_balance_after: entry.destination_balance_after.map(|b| b.to_major()),
            actor_account_id: entry.actor_account_id,
            failure_reason: entry.failure_reason,
            correlation_id: entry.correlation_id,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub account_id: Uuid,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub has_more: bool,
    pub entries: Vec<EntryResponse>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: AccountStatus,
}

// =========================================================================
// API Router
// =========================================================================

/// Routes that act on behalf of an authenticated actor
pub fn actor_routes() -> Router<AppState> {
    Router::new()
        .route("/operations", post(submit_operation))
        .route("/accounts/:account_id/balance", get(get_balance))
        .route("/accounts/:account_id/history", get(get_history))
        .route("/ledger/entries/:entry_id", get(get_entry))
        .route("/admin/accounts/:account_id/status", patch(update_account_status))
        .route("/admin/reconciliation", get(reconciliation))
}

/// Onboarding runs before the owner has an account to act from
pub fn onboarding_routes() -> Router<AppState> {
    Router::new().route("/accounts", post(open_account))
}

fn require_admin(actor: &Actor) -> Result<(), AppError> {
    if actor.role.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden("admin role required".to_string()))
    }
}

fn require_view(actor: &Actor, account_id: Uuid) -> Result<(), AppError> {
    if actor.can_view(account_id) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "actor may not read account {}",
            account_id
        )))
    }
}

// =========================================================================
// POST /accounts
// =========================================================================

async fn open_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<OpenAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    let account = state
        .accounts
        .open_account(request.owner_id, request.role, &request.handle, &context)
        .await?;

    Ok((StatusCode::CREATED, Json(account.into())))
}

// =========================================================================
// POST /operations
// =========================================================================

async fn submit_operation(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Extension(context): Extension<OperationContext>,
    headers: HeaderMap,
    Json(body): Json<SubmitOperationRequest>,
) -> Result<(StatusCode, Json<ReceiptResponse>), AppError> {
    let header_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| AppError::InvalidRequest("Idempotency-Key is not ASCII".to_string()))
        })
        .transpose()?;

    let request = body.into_request(header_key)?;
    let receipt = state.engine.execute(&actor, request, &context).await?;

    Ok((StatusCode::CREATED, Json(receipt.into())))
}

// =========================================================================
// GET /accounts/:account_id/balance
// =========================================================================

async fn get_balance(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<BalanceResponse>, AppError> {
    require_view(&actor, account_id)?;
    let balance = state.query.get_balance(account_id).await?;

    Ok(Json(BalanceResponse {
        account_id,
        balance: balance.to_major(),
    }))
}

// =========================================================================
// GET /accounts/:account_id/history
// =========================================================================

async fn get_history(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(account_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    require_view(&actor, account_id)?;
    let query = params.into_query()?;
    let page = state.query.get_history(account_id, query).await?;
    let has_more = page.has_more();

    Ok(Json(HistoryResponse {
        account_id,
        page: page.page,
        page_size: page.page_size,
        total: page.total,
        has_more,
        entries: page.items.into_iter().map(EntryResponse::from).collect(),
    }))
}

// =========================================================================
// GET /ledger/entries/:entry_id
// =========================================================================

async fn get_entry(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<EntryResponse>, AppError> {
    let entry = state.query.get_entry(entry_id).await?;

    let involved = entry.touches(actor.account_id) || entry.actor_account_id == actor.account_id;
    if !involved && !actor.role.is_admin() {
        return Err(AppError::Forbidden(format!(
            "actor may not read ledger entry {}",
            entry_id
        )));
    }

    Ok(Json(entry.into()))
}

// =========================================================================
// PATCH /admin/accounts/:account_id/status
// =========================================================================

async fn update_account_status(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    require_admin(&actor)?;
    let account = state.accounts.set_status(account_id, request.status).await?;
    tracing::info!(
        admin = %actor.account_id,
        account_id = %account_id,
        status = %request.status,
        "Account status updated by admin"
    );

    Ok(Json(account.into()))
}

// =========================================================================
// GET /admin/reconciliation
// =========================================================================

async fn reconciliation(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<ReconciliationReport>, AppError> {
    require_admin(&actor)?;
    Ok(Json(state.query.verify_ledger().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_operation_request_deserialize() {
        let json = r#"{
            "kind": "TRANSFER",
            "amount": "40.00",
            "destination_handle": "01711111111"
        }"#;

        let body: SubmitOperationRequest = serde_json::from_str(json).unwrap();
        let request = body.into_request(Some("order-1".to_string())).unwrap();

        assert_eq!(request.kind, OperationKind::Transfer);
        assert_eq!(request.amount, 4000);
        assert_eq!(
            request.destination,
            Some(AccountRef::Handle("01711111111".to_string()))
        );
        assert_eq!(request.idempotency_key.as_deref(), Some("order-1"));
    }

    #[test]
    fn test_conflicting_idempotency_keys_rejected() {
        let body = SubmitOperationRequest {
            kind: OperationKind::Deposit,
            amount: "1.00".to_string(),
            destination_account_id: None,
            destination_handle: None,
            idempotency_key: Some("a".to_string()),
            nonce: None,
        };
        assert!(matches!(
            body.into_request(Some("b".to_string())),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_bad_amount_rejected() {
        for amount in ["0", "-5.00", "1.005", "abc"] {
            let body = SubmitOperationRequest {
                kind: OperationKind::Deposit,
                amount: amount.to_string(),
                destination_account_id: None,
                destination_handle: None,
                idempotency_key: None,
                nonce: None,
            };
            assert!(
                matches!(body.into_request(None), Err(AppError::Validation(_))),
                "{} should be rejected",
                amount
            );
        }
    }

    #[test]
    fn test_history_params() {
        let params: HistoryParams = serde_json::from_str(
            r#"{"page": 2, "kinds": "deposit, transfer", "include_failed": true}"#,
        )
        .unwrap();
        let query = params.into_query().unwrap();

        assert_eq!(query.page, 2);
        assert_eq!(query.page_size, 20);
        assert_eq!(query.kinds, vec![OperationKind::Deposit, OperationKind::Transfer]);
        assert!(query.include_failed);

        let bad: HistoryParams = serde_json::from_str(r#"{"kinds": "REFUND"}"#).unwrap();
        assert!(bad.into_query().is_err());
    }
}

//! PostgreSQL storage backend
//!
//! One atomic scope is one database transaction. Accounts are locked with
//! `SELECT ... FOR UPDATE` in id order; `adjust` is a guarded
//! compare-and-swap `UPDATE` so a stale version or an overdraft never
//! touches the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{
    AccountStore, Adjusted, AtomicScope, IdempotencyStore, LedgerSnapshot, LedgerStore, Storage,
    StoreError, StoreResult,
};
use crate::db;
use crate::domain::{
    Account, AccountStatus, Amount, Balance, EntryStatus, HistoryQuery, LedgerEntry, Page,
};
use crate::idempotency::{IdempotencyRecord, ReserveOutcome};

const ACCOUNT_COLUMNS: &str =
    "id, owner_id, owner_role, handle, balance, version, status, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, sequence, kind, source_account_id, destination_account_id, \
     amount, source_balance_after, destination_balance_after, actor_account_id, \
     idempotency_key, status, failure_reason, correlation_id, created_at";

const IDEMPOTENCY_COLUMNS: &str =
    "key, reservation_id, fingerprint, status, ledger_entry_id, created_at, expires_at";

const UNIQUE_VIOLATION: &str = "23505";

// =========================================================================
// Row mapping
// =========================================================================

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    owner_id: Uuid,
    owner_role: String,
    handle: String,
    balance: i64,
    version: i64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: row.id,
            owner_id: row.owner_id,
            owner_role: row.owner_role.parse().map_err(corrupt)?,
            handle: row.handle,
            balance: Balance::new(row.balance).map_err(corrupt)?,
            version: row.version,
            status: row.status.parse().map_err(corrupt)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    sequence: i64,
    kind: String,
    source_account_id: Option<Uuid>,
    destination_account_id: Option<Uuid>,
    amount: i64,
    source_balance_after: Option<i64>,
    destination_balance_after: Option<i64>,
    actor_account_id: Uuid,
    idempotency_key: String,
    status: String,
    failure_reason: Option<String>,
    correlation_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let snapshot = |value: Option<i64>| value.map(Balance::new).transpose().map_err(corrupt);

        Ok(LedgerEntry {
            id: row.id,
            sequence: row.sequence,
            kind: row.kind.parse().map_err(corrupt)?,
            source_account_id: row.source_account_id,
            destination_account_id: row.destination_account_id,
            amount: Amount::new(row.amount).map_err(corrupt)?,
            source_balance_after: snapshot(row.source_balance_after)?,
            destination_balance_after: snapshot(row.destination_balance_after)?,
            actor_account_id: row.actor_account_id,
            idempotency_key: row.idempotency_key,
            status: row.status.parse().map_err(corrupt)?,
            failure_reason: row.failure_reason,
            correlation_id: row.correlation_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IdempotencyRow {
    key: String,
    reservation_id: Uuid,
    fingerprint: String,
    status: String,
    ledger_entry_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = StoreError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        Ok(IdempotencyRecord {
            key: row.key,
            reservation_id: row.reservation_id,
            fingerprint: row.fingerprint,
            status: row.status.parse().map_err(corrupt)?,
            ledger_entry_id: row.ledger_entry_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

/// Name of the unique constraint a statement violated, if any
fn unique_violation(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            Some(db.constraint().unwrap_or("unique").to_string())
        }
        _ => None,
    }
}

async fn insert_entry(
    conn: &mut sqlx::PgConnection,
    entry: &LedgerEntry,
) -> StoreResult<Uuid> {
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO ledger_entries (
            id, kind, source_account_id, destination_account_id, amount,
            source_balance_after, destination_balance_after, actor_account_id,
            idempotency_key, status, failure_reason, correlation_id, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING id
        "#,
    )
    .bind(entry.id)
    .bind(entry.kind.as_str())
    .bind(entry.source_account_id)
    .bind(entry.destination_account_id)
    .bind(entry.amount.minor_units())
    .bind(entry.source_balance_after.map(|b| b.minor_units()))
    .bind(entry.destination_balance_after.map(|b| b.minor_units()))
    .bind(entry.actor_account_id)
    .bind(&entry.idempotency_key)
    .bind(entry.status.as_str())
    .bind(&entry.failure_reason)
    .bind(entry.correlation_id)
    .bind(entry.created_at)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

// =========================================================================
// Storage handle
// =========================================================================

#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// A database transaction acting as an atomic scope
pub struct PgScope {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AtomicScope for PgScope {
    async fn lock_accounts(&mut self, ids: &[Uuid]) -> StoreResult<Vec<Account>> {
        let mut ordered = ids.to_vec();
        ordered.sort();
        ordered.dedup();

        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(&ordered)
        .fetch_all(&mut *self.tx)
        .await?;

        if let Some(missing) = ordered.iter().find(|id| !rows.iter().any(|row| row.id == **id)) {
            return Err(StoreError::AccountNotFound(*missing));
        }

        rows.into_iter().map(Account::try_from).collect()
    }

    async fn adjust(
        &mut self,
        account_id: Uuid,
        delta: i64,
        expected_version: i64,
    ) -> StoreResult<Adjusted> {
        let updated: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE accounts
            SET balance = balance + $2, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $3 AND balance + $2 >= 0
            RETURNING balance, version
            "#,
        )
        .bind(account_id)
        .bind(delta)
        .bind(expected_version)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some((balance, version)) = updated {
            return Ok(Adjusted {
                balance: Balance::new(balance).map_err(corrupt)?,
                version,
            });
        }

        // Work out which guard rejected the update
        let current: Option<(i64, i64)> =
            sqlx::query_as("SELECT balance, version FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&mut *self.tx)
                .await?;

        match current {
            None => Err(StoreError::AccountNotFound(account_id)),
            Some((_, version)) if version != expected_version => Err(StoreError::VersionConflict {
                account_id,
                expected: expected_version,
                found: version,
            }),
            Some((balance, _)) => Err(StoreError::InsufficientFunds {
                account_id,
                required: delta.saturating_neg(),
                available: balance,
            }),
        }
    }

    async fn insert_account(&mut self, account: &Account) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, owner_id, owner_role, handle, balance, version, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(account.id)
        .bind(account.owner_id)
        .bind(account.owner_role.as_str())
        .bind(&account.handle)
        .bind(account.balance.minor_units())
        .bind(account.version)
        .bind(account.status.as_str())
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match unique_violation(&e) {
            Some(constraint) => StoreError::DuplicateAccount(constraint),
            None => StoreError::Database(e),
        })?;

        Ok(())
    }

    async fn append(&mut self, entry: &LedgerEntry) -> StoreResult<Uuid> {
        insert_entry(&mut *self.tx, entry).await
    }

    async fn complete_idempotency(
        &mut self,
        key: &str,
        reservation_id: Uuid,
        ledger_entry_id: Uuid,
    ) -> StoreResult<()> {
        // The row lock taken here serializes two scopes racing on one key
        let rows = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'COMPLETED', ledger_entry_id = $3
            WHERE key = $1 AND reservation_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(key)
        .bind(reservation_id)
        .bind(ledger_entry_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(StoreError::DuplicateIdempotencyKey(key.to_string()));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PgStorage {
    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    async fn find_account_by_handle(&self, handle: &str) -> StoreResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE handle = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    async fn find_account_by_owner(&self, owner_id: Uuid) -> StoreResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE owner_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    async fn get_balance(&self, account_id: Uuid) -> StoreResult<Balance> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        balance
            .ok_or(StoreError::AccountNotFound(account_id))
            .and_then(|b| Balance::new(b).map_err(corrupt))
    }

    async fn set_account_status(
        &self,
        account_id: Uuid,
        expected: AccountStatus,
        status: AccountStatus,
    ) -> StoreResult<Account> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            r#"
            UPDATE accounts SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = $3
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .bind(status.as_str())
        .bind(expected.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Account::try_from(row);
        }

        let found: Option<String> =
            sqlx::query_scalar("SELECT status FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        match found {
            None => Err(StoreError::AccountNotFound(account_id)),
            Some(found) => Err(StoreError::StatusConflict {
                account_id,
                found: found.parse().map_err(corrupt)?,
                requested: status,
            }),
        }
    }
}

fn push_history_filters<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    account_id: Uuid,
    query: &'a HistoryQuery,
) {
    builder
        .push(" WHERE (source_account_id = ")
        .push_bind(account_id)
        .push(" OR destination_account_id = ")
        .push_bind(account_id)
        .push(")");

    if !query.include_failed {
        builder
            .push(" AND status = ")
            .push_bind(EntryStatus::Committed.as_str());
    }
    if !query.kinds.is_empty() {
        let kinds: Vec<String> = query.kinds.iter().map(|k| k.as_str().to_string()).collect();
        builder.push(" AND kind = ANY(").push_bind(kinds).push(")");
    }
    if let Some(from) = query.from {
        builder.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = query.to {
        builder.push(" AND created_at < ").push_bind(to);
    }
}

#[async_trait]
impl LedgerStore for PgStorage {
    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<Uuid> {
        let mut conn = self.pool.acquire().await?;
        insert_entry(&mut *conn, entry).await
    }

    async fn get_entry(&self, entry_id: Uuid) -> StoreResult<Option<LedgerEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_entries WHERE id = $1",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LedgerEntry::try_from).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<LedgerEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_entries \
             WHERE idempotency_key = $1 AND status = 'COMMITTED' \
             ORDER BY sequence DESC LIMIT 1",
            ENTRY_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LedgerEntry::try_from).transpose()
    }

    async fn list_by_account(
        &self,
        account_id: Uuid,
        query: &HistoryQuery,
    ) -> StoreResult<Page<LedgerEntry>> {
        let query = query.clone().normalized();

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ledger_entries");
        push_history_filters(&mut count, account_id, &query);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM ledger_entries", ENTRY_COLUMNS));
        push_history_filters(&mut select, account_id, &query);
        select
            .push(" ORDER BY sequence DESC LIMIT ")
            .push_bind(i64::from(query.page_size))
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);
        let rows: Vec<EntryRow> = select.build_query_as::<EntryRow>().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(LedgerEntry::try_from)
                .collect::<StoreResult<_>>()?,
            page: query.page,
            page_size: query.page_size,
            total: total.max(0) as u64,
        })
    }

    async fn ledger_snapshot(&self) -> StoreResult<LedgerSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let accounts: Vec<AccountRow> =
            sqlx::query_as(&format!("SELECT {} FROM accounts", ACCOUNT_COLUMNS))
                .fetch_all(&mut *tx)
                .await?;
        let entries: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_entries WHERE status = 'COMMITTED' ORDER BY sequence",
            ENTRY_COLUMNS
        ))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(LedgerSnapshot {
            accounts: accounts
                .into_iter()
                .map(Account::try_from)
                .collect::<StoreResult<_>>()?,
            entries: entries
                .into_iter()
                .map(LedgerEntry::try_from)
                .collect::<StoreResult<_>>()?,
        })
    }
}

#[async_trait]
impl IdempotencyStore for PgStorage {
    async fn reserve(&self, record: &IdempotencyRecord) -> StoreResult<ReserveOutcome> {
        const MAX_ATTEMPTS: u32 = 3;

        for _ in 0..MAX_ATTEMPTS {
            // Takes the key when absent or expired
            let acquired: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO idempotency_keys (
                    key, reservation_id, fingerprint, status, created_at, expires_at
                )
                VALUES ($1, $2, $3, 'PENDING', $4, $5)
                ON CONFLICT (key) DO UPDATE
                SET reservation_id = EXCLUDED.reservation_id,
                    fingerprint = EXCLUDED.fingerprint,
                    status = 'PENDING',
                    ledger_entry_id = NULL,
                    created_at = EXCLUDED.created_at,
                    expires_at = EXCLUDED.expires_at
                WHERE idempotency_keys.expires_at <= NOW()
                RETURNING key
                "#,
            )
            .bind(&record.key)
            .bind(record.reservation_id)
            .bind(&record.fingerprint)
            .bind(record.created_at)
            .bind(record.expires_at)
            .fetch_optional(&self.pool)
            .await?;

            if acquired.is_some() {
                return Ok(ReserveOutcome::Acquired);
            }
            // Released between the insert and this read: try again
            if let Some(existing) = self.get_idempotency(&record.key).await? {
                return Ok(ReserveOutcome::Existing(existing));
            }
        }

        Err(StoreError::Backend(format!(
            "could not reserve idempotency key {}",
            record.key
        )))
    }

    async fn get_idempotency(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let row: Option<IdempotencyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM idempotency_keys WHERE key = $1",
            IDEMPOTENCY_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn release(&self, key: &str, reservation_id: Uuid) -> StoreResult<bool> {
        let rows = sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE key = $1 AND reservation_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(key)
        .bind(reservation_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let rows = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows)
    }

    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let rows = sqlx::query(
            "DELETE FROM idempotency_keys WHERE status = 'PENDING' AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn begin(&self) -> StoreResult<Box<dyn AtomicScope>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgScope { tx }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        db::verify_connection(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

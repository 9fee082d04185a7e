//! Idempotency Guard
//!
//! Reserves keys before the engine's atomic scope so two requests bearing
//! the same key can never both commit.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

use super::record::{IdempotencyRecord, ReserveOutcome};
use crate::domain::{AccountRef, Actor, OperationKind, OperationRequest, ValidationError};
use crate::store::{IdempotencyStore, Storage, StoreError, StoreResult};

pub const MAX_KEY_LENGTH: usize = 255;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What the guard decided for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Proceed; the record must be completed in the scope or released
    Acquired(IdempotencyRecord),
    /// Already committed; replay the entry
    Completed { ledger_entry_id: Uuid },
    /// Another request holds the key
    InFlight,
    /// Key reused with a different request
    Conflict,
}

/// SHA-256 over the fields that define the intent of a request
pub fn fingerprint(actor: &Actor, request: &OperationRequest) -> String {
    let destination = match &request.destination {
        Some(AccountRef::Id(id)) => format!("id:{}", id),
        Some(AccountRef::Handle(handle)) => format!("handle:{}", handle),
        None => String::new(),
    };

    let mut hasher = Sha256::new();
    hasher.update(actor.account_id.as_bytes());
    hasher.update(request.kind.as_str());
    hasher.update(request.amount.to_be_bytes());
    hasher.update(destination);
    hex::encode(hasher.finalize())
}

/// Key for requests that arrive without one
pub fn derive_key(actor: &Actor, kind: OperationKind, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(actor.account_id.as_bytes());
    hasher.update(kind.as_str());
    hasher.update(nonce);
    format!("derived:{}", hex::encode(hasher.finalize()))
}

pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::InvalidIdempotencyKey("empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(ValidationError::InvalidIdempotencyKey(format!(
            "longer than {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(ValidationError::InvalidIdempotencyKey(
            "contains control characters".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    storage: Arc<dyn Storage>,
    ttl: chrono::Duration,
    poll_interval: Duration,
}

impl IdempotencyGuard {
    pub fn new(storage: Arc<dyn Storage>, ttl: chrono::Duration) -> Self {
        Self {
            storage,
            ttl,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Check-and-reserve in one step
    pub async fn reserve(&self, key: &str, fingerprint: &str) -> StoreResult<Reservation> {
        let record = IdempotencyRecord::pending(key, fingerprint, self.ttl);

        match self.storage.reserve(&record).await? {
            ReserveOutcome::Acquired => {
                tracing::debug!(key = %key, reservation_id = %record.reservation_id, "Idempotency key reserved");
                Ok(Reservation::Acquired(record))
            }
            ReserveOutcome::Existing(existing) if existing.fingerprint != fingerprint => {
                tracing::warn!(key = %key, "Idempotency key reused with a different request");
                Ok(Reservation::Conflict)
            }
            ReserveOutcome::Existing(existing) if existing.is_completed() => {
                let ledger_entry_id = existing.ledger_entry_id.ok_or_else(|| {
                    StoreError::Corrupt(format!("completed key {} has no ledger entry", key))
                })?;
                Ok(Reservation::Completed { ledger_entry_id })
            }
            ReserveOutcome::Existing(_) => Ok(Reservation::InFlight),
        }
    }

    /// Reserve, waiting up to `wait` for an in-flight holder to finish.
    ///
    /// Returns `InFlight` only if the holder is still running at the
    /// deadline.
    pub async fn settle(
        &self,
        key: &str,
        fingerprint: &str,
        wait: Duration,
    ) -> StoreResult<Reservation> {
        let deadline = Instant::now() + wait;

        loop {
            let reservation = self.reserve(key, fingerprint).await?;
            if reservation != Reservation::InFlight || Instant::now() >= deadline {
                return Ok(reservation);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Give the key back after a failed operation. Best effort.
    pub async fn release(&self, record: &IdempotencyRecord) {
        match self.storage.release(&record.key, record.reservation_id).await {
            Ok(true) => tracing::debug!(key = %record.key, "Idempotency key released"),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(key = %record.key, error = %e, "Failed to release idempotency key")
            }
        }
    }
}

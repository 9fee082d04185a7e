//! Idempotency records
//!
//! Stored state for one idempotency key.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Idempotency key status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "PENDING",
            IdempotencyStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(IdempotencyStatus::Pending),
            "COMPLETED" => Ok(IdempotencyStatus::Completed),
            other => Err(format!("Unknown idempotency status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Identifies one reservation of the key; completion and release
    /// only apply to the reservation that created the row
    pub reservation_id: Uuid,
    /// SHA-256 of the request, to catch key reuse with a different body
    pub fingerprint: String,
    pub status: IdempotencyStatus,
    pub ledger_entry_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(key: impl Into<String>, fingerprint: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            reservation_id: Uuid::new_v4(),
            fingerprint: fingerprint.into(),
            status: IdempotencyStatus::Pending,
            ledger_entry_id: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }
}

/// What `reserve` found for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The caller now holds the key
    Acquired,
    /// A live record already holds the key
    Existing(IdempotencyRecord),
}

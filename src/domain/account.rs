//! Account
//!
//! Wallet account state as held by the account store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::actor::Role;
use super::amount::Balance;

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    #[default]
    Active,
    Frozen,
    /// Terminal; closed accounts are flagged, never deleted
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Frozen => "FROZEN",
            AccountStatus::Closed => "CLOSED",
        }
    }

    pub fn can_transition_to(&self, next: AccountStatus) -> bool {
        !matches!(self, AccountStatus::Closed) && *self != next
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(AccountStatus::Active),
            "FROZEN" => Ok(AccountStatus::Frozen),
            "CLOSED" => Ok(AccountStatus::Closed),
            other => Err(format!("Unknown account status: {}", other)),
        }
    }
}

/// A wallet account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub owner_role: Role,
    /// Phone number or email the owner registered with
    pub handle: String,
    pub balance: Balance,
    /// Lock token, incremented on every balance adjustment
    pub version: i64,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A freshly onboarded account at zero balance and version 0
    pub fn open(owner_id: Uuid, owner_role: Role, handle: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            owner_role,
            handle: handle.into(),
            balance: Balance::zero(),
            version: 0,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

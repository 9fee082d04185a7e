//! Amount and Balance types
//!
//! Domain primitives for money held in integer minor units (cents, paisa).
//! All amounts are validated at construction time, ensuring invalid values
//! cannot exist in the system. Decimal strings only appear at the edges and
//! are converted with `rust_decimal`, never through floating point.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum single amount or balance (one trillion major units)
pub const MAX_MINOR_UNITS: i64 = 100_000_000_000_000;

/// Decimal places between major and minor units
pub const MINOR_UNIT_SCALE: u32 = 2;

/// Amount represents a validated, strictly positive sum of minor units.
///
/// # Invariants
/// - Value is always positive (> 0)
/// - Value never exceeds `MAX_MINOR_UNITS`
///
/// # Example
/// ```
/// use wallet_ledger::domain::Amount;
///
/// let amount = Amount::new(4_000).unwrap();
/// assert_eq!(amount.minor_units(), 4_000);
/// assert_eq!(amount.to_string(), "40.00");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

/// Errors that can occur when creating an Amount or Balance
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Amount must be positive (got {0})")]
    NotPositive(i64),

    #[error("Balance cannot be negative (got {0})")]
    Negative(i64),

    #[error("Amount has too many decimal places (max {MINOR_UNIT_SCALE}, got {0})")]
    TooManyDecimals(u32),

    #[error("Amount exceeds maximum allowed value ({MAX_MINOR_UNITS} minor units)")]
    Overflow,

    #[error("Invalid amount format: {0}")]
    ParseError(String),
}

impl Amount {
    /// Create a new Amount with validation.
    ///
    /// # Errors
    /// - `AmountError::NotPositive` if value <= 0
    /// - `AmountError::Overflow` if value > `MAX_MINOR_UNITS`
    pub fn new(minor_units: i64) -> Result<Self, AmountError> {
        if minor_units <= 0 {
            return Err(AmountError::NotPositive(minor_units));
        }
        if minor_units > MAX_MINOR_UNITS {
            return Err(AmountError::Overflow);
        }
        Ok(Self(minor_units))
    }

    /// Parse a major-unit decimal string such as `"50.25"`.
    pub fn from_major_str(s: &str) -> Result<Self, AmountError> {
        let decimal = Decimal::from_str(s.trim())
            .map_err(|e| AmountError::ParseError(e.to_string()))?;
        Self::from_major(decimal)
    }

    /// Convert a major-unit decimal into minor units.
    pub fn from_major(value: Decimal) -> Result<Self, AmountError> {
        let normalized = value.normalize();
        if normalized.scale() > MINOR_UNIT_SCALE {
            return Err(AmountError::TooManyDecimals(normalized.scale()));
        }
        let minor = (normalized * Decimal::from(10_i64.pow(MINOR_UNIT_SCALE)))
            .to_i64()
            .ok_or(AmountError::Overflow)?;
        Self::new(minor)
    }

    /// Get the value in minor units.
    pub fn minor_units(&self) -> i64 {
        self.0
    }

    /// Get the value as a major-unit decimal (for display only).
    pub fn to_major(&self) -> Decimal {
        Decimal::new(self.0, MINOR_UNIT_SCALE)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_major())
    }
}

impl TryFrom<i64> for Amount {
    type Error = AmountError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Amount::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::from_major_str(s)
    }
}

/// Balance represents an account balance (zero or positive).
/// Unlike Amount, Balance can be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Balance(i64);

impl Balance {
    /// Create a new balance (zero or positive)
    pub fn new(minor_units: i64) -> Result<Self, AmountError> {
        if minor_units < 0 {
            return Err(AmountError::Negative(minor_units));
        }
        if minor_units > MAX_MINOR_UNITS {
            return Err(AmountError::Overflow);
        }
        Ok(Self(minor_units))
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn minor_units(&self) -> i64 {
        self.0
    }

    pub fn to_major(&self) -> Decimal {
        Decimal::new(self.0, MINOR_UNIT_SCALE)
    }

    /// Check if balance is sufficient for a debit
    pub fn is_sufficient_for(&self, amount: &Amount) -> bool {
        self.0 >= amount.0
    }

    /// Add amount to balance
    pub fn credit(&self, amount: &Amount) -> Result<Balance, AmountError> {
        let new_value = self.0.checked_add(amount.0).ok_or(AmountError::Overflow)?;
        Balance::new(new_value)
    }

    /// Subtract amount from balance
    pub fn debit(&self, amount: &Amount) -> Result<Balance, AmountError> {
        Balance::new(self.0 - amount.0)
    }

    /// Apply a signed delta, as the account store does on `adjust`.
    pub fn apply_delta(&self, delta: i64) -> Result<Balance, AmountError> {
        let new_value = self.0.checked_add(delta).ok_or(AmountError::Overflow)?;
        Balance::new(new_value)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_major())
    }
}

impl Default for Balance {
    fn default() -> Self {
        Self::zero()
    }
}

impl TryFrom<i64> for Balance {
    type Error = AmountError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Balance::new(value)
    }
}

impl From<Balance> for i64 {
    fn from(balance: Balance) -> Self {
        balance.0
    }
}

//! Idempotency module
//!
//! Prevents a retried request from being applied twice.

mod guard;
mod record;

pub use guard::{derive_key, fingerprint, validate_key, IdempotencyGuard, Reservation, MAX_KEY_LENGTH};
pub use record::{IdempotencyRecord, IdempotencyStatus, ReserveOutcome};

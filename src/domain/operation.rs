//! Operations
//!
//! Money-movement request types, the static capability map and the
//! per-kind movement shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::actor::Role;
use super::amount::{Amount, Balance};
use super::error::ValidationError;

/// Kind of balance-affecting operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Deposit,
    Withdraw,
    Transfer,
    AgentCashIn,
    AgentCashOut,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Deposit,
        OperationKind::Withdraw,
        OperationKind::Transfer,
        OperationKind::AgentCashIn,
        OperationKind::AgentCashOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "DEPOSIT",
            OperationKind::Withdraw => "WITHDRAW",
            OperationKind::Transfer => "TRANSFER",
            OperationKind::AgentCashIn => "AGENT_CASH_IN",
            OperationKind::AgentCashOut => "AGENT_CASH_OUT",
        }
    }

    /// Roles allowed to submit this kind.
    pub fn allowed_roles(&self) -> &'static [Role] {
        match self {
            OperationKind::Deposit | OperationKind::Withdraw | OperationKind::Transfer => {
                &[Role::User, Role::Agent]
            }
            OperationKind::AgentCashIn | OperationKind::AgentCashOut => &[Role::Agent],
        }
    }

    pub fn permits(&self, role: Role) -> bool {
        self.allowed_roles().contains(&role)
    }

    /// Whether the request must name a counterparty account
    pub fn requires_destination(&self) -> bool {
        matches!(
            self,
            OperationKind::Transfer | OperationKind::AgentCashIn | OperationKind::AgentCashOut
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown operation kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for OperationKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// How a request names the counterparty account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRef {
    Id(Uuid),
    /// Phone number or email registered at onboarding
    Handle(String),
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountRef::Id(id) => write!(f, "{}", id),
            AccountRef::Handle(handle) => f.write_str(handle),
        }
    }
}

/// Validated request payload from the request layer.
///
/// `amount` stays a raw minor-unit integer here; positivity is checked by
/// the engine so a zero or negative amount is a validation failure rather
/// than an unrepresentable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub amount: i64,
    #[serde(default)]
    pub destination: Option<AccountRef>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Client nonce used to derive a key when none is supplied
    #[serde(default)]
    pub nonce: Option<String>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, amount: i64) -> Self {
        Self {
            kind,
            amount,
            destination: None,
            idempotency_key: None,
            nonce: None,
        }
    }

    pub fn deposit(amount: i64) -> Self {
        Self::new(OperationKind::Deposit, amount)
    }

    pub fn withdraw(amount: i64) -> Self {
        Self::new(OperationKind::Withdraw, amount)
    }

    pub fn transfer(destination: Uuid, amount: i64) -> Self {
        Self::new(OperationKind::Transfer, amount).with_destination(AccountRef::Id(destination))
    }

    pub fn with_destination(mut self, destination: AccountRef) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}

/// The accounts an operation touches, one variant per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    Deposit { destination: Uuid },
    Withdraw { source: Uuid },
    Transfer { source: Uuid, destination: Uuid },
    AgentCashIn { float: Option<Uuid>, user: Uuid },
    AgentCashOut { user: Uuid, float: Option<Uuid> },
}

impl Movement {
    /// Build the movement for `kind` submitted from `actor_account`.
    ///
    /// `counterparty` is the resolved destination account. With
    /// `agent_float` the agent's own account is the float leg of cash
    /// operations.
    pub fn resolve(
        kind: OperationKind,
        actor_account: Uuid,
        counterparty: Option<Uuid>,
        agent_float: bool,
    ) -> Result<Self, ValidationError> {
        let movement = match (kind, counterparty) {
            (OperationKind::Deposit, None) => Movement::Deposit {
                destination: actor_account,
            },
            (OperationKind::Withdraw, None) => Movement::Withdraw {
                source: actor_account,
            },
            (OperationKind::Deposit | OperationKind::Withdraw, Some(_)) => {
                return Err(ValidationError::UnexpectedDestination(kind));
            }
            (_, None) => return Err(ValidationError::MissingDestination(kind)),
            (OperationKind::Transfer, Some(destination)) => Movement::Transfer {
                source: actor_account,
                destination,
            },
            (OperationKind::AgentCashIn, Some(user)) => Movement::AgentCashIn {
                float: agent_float.then_some(actor_account),
                user,
            },
            (OperationKind::AgentCashOut, Some(user)) => Movement::AgentCashOut {
                user,
                float: agent_float.then_some(actor_account),
            },
        };

        // Agents may not cash in or out of their own wallet either
        if counterparty == Some(actor_account) {
            return Err(ValidationError::SameAccount);
        }

        Ok(movement)
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Movement::Deposit { .. } => OperationKind::Deposit,
            Movement::Withdraw { .. } => OperationKind::Withdraw,
            Movement::Transfer { .. } => OperationKind::Transfer,
            Movement::AgentCashIn { .. } => OperationKind::AgentCashIn,
            Movement::AgentCashOut { .. } => OperationKind::AgentCashOut,
        }
    }

    /// Debited account, if any
    pub fn source(&self) -> Option<Uuid> {
        match *self {
            Movement::Deposit { .. } => None,
            Movement::Withdraw { source } => Some(source),
            Movement::Transfer { source, .. } => Some(source),
            Movement::AgentCashIn { float, .. } => float,
            Movement::AgentCashOut { user, .. } => Some(user),
        }
    }

    /// Credited account, if any
    pub fn destination(&self) -> Option<Uuid> {
        match *self {
            Movement::Deposit { destination } => Some(destination),
            Movement::Withdraw { .. } => None,
            Movement::Transfer { destination, .. } => Some(destination),
            Movement::AgentCashIn { user, .. } => Some(user),
            Movement::AgentCashOut { float, .. } => float,
        }
    }

    /// Accounts to lock, in ascending id order
    pub fn lock_order(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.source().into_iter().chain(self.destination()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Result returned to the caller of `execute`, identical on replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReceipt {
    pub ledger_entry_id: Uuid,
    pub kind: OperationKind,
    pub amount: Amount,
    /// Actor's own balance if their account moved, else the customer's
    pub new_balance: Balance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_map() {
        assert!(OperationKind::Transfer.permits(Role::User));
        assert!(OperationKind::Deposit.permits(Role::Agent));
        assert!(OperationKind::AgentCashIn.permits(Role::Agent));
        assert!(!OperationKind::AgentCashOut.permits(Role::User));
        assert!(!OperationKind::Withdraw.permits(Role::Admin));
    }

    #[test]
    fn test_kind_parse_and_serde() {
        assert_eq!(
            "agent_cash_in".parse::<OperationKind>().unwrap(),
            OperationKind::AgentCashIn
        );
        assert!("refund".parse::<OperationKind>().is_err());

        let json = serde_json::to_string(&OperationKind::AgentCashOut).unwrap();
        assert_eq!(json, r#""AGENT_CASH_OUT""#);
    }

    #[test]
    fn test_resolve_shapes() {
        let actor = Uuid::new_v4();
        let other = Uuid::new_v4();

        let deposit = Movement::resolve(OperationKind::Deposit, actor, None, true).unwrap();
        assert_eq!(deposit.source(), None);
        assert_eq!(deposit.destination(), Some(actor));

        let withdraw = Movement::resolve(OperationKind::Withdraw, actor, None, true).unwrap();
        assert_eq!(withdraw.source(), Some(actor));
        assert_eq!(withdraw.destination(), None);

        let transfer =
            Movement::resolve(OperationKind::Transfer, actor, Some(other), true).unwrap();
        assert_eq!(transfer.source(), Some(actor));
        assert_eq!(transfer.destination(), Some(other));
    }

    #[test]
    fn test_resolve_agent_float() {
        let agent = Uuid::new_v4();
        let user = Uuid::new_v4();

        let with_float =
            Movement::resolve(OperationKind::AgentCashIn, agent, Some(user), true).unwrap();
        assert_eq!(with_float.source(), Some(agent));
        assert_eq!(with_float.destination(), Some(user));

        let without_float =
            Movement::resolve(OperationKind::AgentCashOut, agent, Some(user), false).unwrap();
        assert_eq!(without_float.source(), Some(user));
        assert_eq!(without_float.destination(), None);
        assert_eq!(without_float.lock_order(), vec![user]);
    }

    #[test]
    fn test_resolve_rejections() {
        let actor = Uuid::new_v4();

        assert_eq!(
            Movement::resolve(OperationKind::Transfer, actor, Some(actor), true),
            Err(ValidationError::SameAccount)
        );
        assert_eq!(
            Movement::resolve(OperationKind::Transfer, actor, None, true),
            Err(ValidationError::MissingDestination(OperationKind::Transfer))
        );
        assert_eq!(
            Movement::resolve(OperationKind::Deposit, actor, Some(Uuid::new_v4()), true),
            Err(ValidationError::UnexpectedDestination(OperationKind::Deposit))
        );
    }

    #[test]
    fn test_lock_order_sorted() {
        let a = Uuid::from_u128(2);
        let b = Uuid::from_u128(1);
        let movement = Movement::Transfer {
            source: a,
            destination: b,
        };
        assert_eq!(movement.lock_order(), vec![b, a]);
    }

    #[test]
    fn test_request_deserialize() {
        let json = r#"{
            "kind": "TRANSFER",
            "amount": 4000,
            "destination": { "handle": "01700000000" },
            "idempotency_key": "abc"
        }"#;
        let request: OperationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.kind, OperationKind::Transfer);
        assert_eq!(
            request.destination,
            Some(AccountRef::Handle("01700000000".to_string()))
        );
        assert!(request.nonce.is_none());
    }
}

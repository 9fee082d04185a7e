//! Actor
//!
//! The authenticated identity handed to the engine by the auth layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Role of an account owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Agent,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Agent => "AGENT",
            Role::Admin => "ADMIN",
            Role::SuperAdmin => "SUPER_ADMIN",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "AGENT" => Ok(Role::Agent),
            "ADMIN" => Ok(Role::Admin),
            "SUPER_ADMIN" => Ok(Role::SuperAdmin),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// Authenticated actor submitting an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// The actor's own wallet account
    pub account_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(account_id: Uuid, role: Role) -> Self {
        Self { account_id, role }
    }

    pub fn user(account_id: Uuid) -> Self {
        Self::new(account_id, Role::User)
    }

    pub fn agent(account_id: Uuid) -> Self {
        Self::new(account_id, Role::Agent)
    }

    /// Whether this actor may read data belonging to `account_id`
    pub fn can_view(&self, account_id: Uuid) -> bool {
        self.account_id == account_id || self.role.is_admin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!("agent".parse::<Role>().unwrap(), Role::Agent);
        assert_eq!("SUPER_ADMIN".parse::<Role>().unwrap(), Role::SuperAdmin);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serde() {
        let json = serde_json::to_string(&Role::SuperAdmin).unwrap();
        assert_eq!(json, r#""SUPER_ADMIN""#);
    }

    #[test]
    fn test_can_view() {
        let own = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert!(Actor::user(own).can_view(own));
        assert!(!Actor::user(own).can_view(other));
        assert!(Actor::new(own, Role::Admin).can_view(other));
    }
}

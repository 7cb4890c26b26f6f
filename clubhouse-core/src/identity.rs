use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Member,
    Partner,
    Admin,
    /// Machine callers: checkout flow, cron.
    Service,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MEMBER" => Ok(Self::Member),
            "PARTNER" => Ok(Self::Partner),
            "ADMIN" => Ok(Self::Admin),
            "SERVICE" => Ok(Self::Service),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Identity taken from a verified bearer token, never from a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthenticatedUser {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    /// Admins and service accounts may run batch jobs and read any statement.
    pub fn is_operator(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Service)
    }
}

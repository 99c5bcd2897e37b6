//! Connection lifecycle state machine.
//!
//! Status transitions are monotone: pending → active → revoked, with revoked
//! terminal. Scope overrides are a sub-transition that replaces the
//! authorized scope set and bumps the authorization version without changing
//! status; they are only legal while the connection is pending or active.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Active,
    Revoked,
}

/// Error for a status string that is not part of the state machine.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown connection status: {0}")]
pub struct UnknownStatus(pub String);

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Active => "active",
            ConnectionStatus::Revoked => "revoked",
        }
    }

    /// Whether the activation transition is legal from this state.
    ///
    /// Activating an already-active connection is treated as an idempotent
    /// no-op by the caller, not a legal transition here.
    pub fn can_activate(&self) -> bool {
        matches!(self, ConnectionStatus::Pending)
    }

    /// Whether a scope override may be applied in this state.
    pub fn allows_scope_override(&self) -> bool {
        matches!(self, ConnectionStatus::Pending | ConnectionStatus::Active)
    }

    /// Whether the connection is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Revoked)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "active" => Ok(ConnectionStatus::Active),
            "revoked" => Ok(ConnectionStatus::Revoked),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

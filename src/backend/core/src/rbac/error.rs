//! Errors raised by the RBAC core.
//!
//! Authorization outcomes are not errors; they are `Decision::Deny` values.
//! Only infrastructure problems and administrative misuse surface here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::models::{RoleId, RouteKey, RuleId};

/// A route that failed to reconcile, with the cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFailure {
    pub route: RouteKey,
    pub reason: String,
}

impl fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.route, self.reason)
    }
}

/// Errors from the RBAC core.
#[derive(Debug, Error)]
pub enum RbacError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(RuleId),

    #[error("Role {role} is not attached to rule {rule}")]
    PermissionNotFound { rule: RuleId, role: RoleId },

    #[error("Reconciliation failed for {} route(s)", failures.len())]
    ReconciliationPartialFailure { failures: Vec<RouteFailure> },

    #[error("Operation exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Invalid RBAC configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl RbacError {
    pub fn storage(message: impl fmt::Display) -> Self {
        Self::StorageUnavailable(message.to_string())
    }

    /// True for failures of the backing store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<sqlx::Error> for RbacError {
    fn from(error: sqlx::Error) -> Self {
        Self::StorageUnavailable(error.to_string())
    }
}

/// Result alias for the RBAC core.
pub type RbacResult<T> = std::result::Result<T, RbacError>;

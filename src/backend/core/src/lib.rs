#![allow(clippy::result_large_err)]
//! # Lingua Core
//!
//! Route-level role-based access control for the Lingua backend.
//!
//! ## Architecture
//!
//! - **RBAC**: role directory, rule registry, declaration API, permission
//!   evaluator, identity resolver and reconciliation engine
//! - **API**: the administrative REST surface, itself declared through RBAC
//! - **Middleware**: bearer-token identity extraction
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **DB**: PostgreSQL pool and migrations

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod rbac;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, LinguaError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{ErrorCode, ErrorContext, LinguaError, Result};
    pub use crate::middleware::{AuthContext, AuthLayer};
    pub use crate::rbac::{
        AccessPolicy, Caller, Decision, DenyReason, MemoryStore, PgStore, Rbac, RbacContext,
        RbacRouter, RbacStore, RoleExpr, RoleId, RouteKey, RuleId, UserId, Visibility,
    };
}

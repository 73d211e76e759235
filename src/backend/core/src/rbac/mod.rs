//! Role-based access control for HTTP routes.
//!
//! This module provides:
//! - **Roles**: the role directory loaded from storage ([`RoleStore`])
//! - **Rules**: one persisted rule per (method, path, service) with a blanket
//!   [`AccessPolicy`] and optional per-role overrides
//! - **Declarations**: routes are declared in code with a privacy flag and a
//!   [`RoleExpr`]; [`RbacRouter`] mounts the handler and declares it in one call
//! - **Evaluation**: [`PermissionEvaluator`] decides Allow / Deny per request
//! - **Reconciliation**: [`ReconciliationEngine`] brings persisted rules in
//!   line with the declared routes without touching operator customizations
//!
//! # Usage
//!
//! ```rust,ignore
//! use lingua_core::rbac::{Rbac, RoleExpr, Visibility, PgStore};
//!
//! let rbac = Rbac::new(config.rbac.clone(), Arc::new(PgStore::new(pool)))?;
//! rbac.init().await?;
//!
//! let app = rbac
//!     .router()
//!     .get("/rules", Visibility::Private, RoleExpr::allow([2]), list_rules)
//!     .into_router();
//!
//! rbac.synchronize().await?;
//! ```

pub mod declare;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod models;
pub mod policy;
pub mod reconcile;
pub mod registry;
pub mod roles;
pub mod service;
pub mod store;

pub use declare::{RbacRouter, ResolvedAccess, RoleExpr, RouteDeclarer, Visibility};
pub use error::{RbacError, RbacResult, RouteFailure};
pub use identity::IdentityResolver;
pub use middleware::{deny_response, PermissionLayer, PermissionService, RbacContext};
pub use models::{
    AccessPolicy, Role, RoleId, RouteKey, RouteSnapshot, Rule, RuleId, RulePermission, UserId,
};
pub use policy::{
    decide, AllowReason, Caller, Decision, DenyReason, Evaluation, Locale, PermissionEvaluator,
    RuleSource,
};
pub use reconcile::{AssignReport, AssignStrategy, ConsistencyReport, ReconciliationEngine, SyncReport};
pub use registry::{DeclaredRoute, RegistryLoad, RegistrySnapshot, RuleRegistry};
pub use roles::{RoleSnapshot, RoleStore};
pub use service::{BootstrapReport, Explanation, FullSyncReport, InitReport, Rbac, RbacStats, ReloadReport};
pub use store::{MemoryStore, PgStore, RbacStore};

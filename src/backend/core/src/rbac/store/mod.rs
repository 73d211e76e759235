//! Persistence seam for the RBAC core.
//!
//! Everything the core reads or writes goes through [`RbacStore`]. Two
//! backends exist: [`PgStore`] over PostgreSQL and [`MemoryStore`] for tests
//! and local development. Every failure of a backend is reported as
//! [`RbacError::StorageUnavailable`](super::error::RbacError).

use async_trait::async_trait;

use super::error::RbacResult;
use super::models::{
    AccessPolicy, NewRule, Role, RoleId, RouteKey, Rule, RuleId, RulePermission, UserId,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of inserting a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleInsert {
    Created(Rule),
    /// Another writer created the same (path, method, service) first.
    AlreadyExists(Rule),
}

impl RuleInsert {
    pub fn rule(&self) -> &Rule {
        match self {
            Self::Created(rule) | Self::AlreadyExists(rule) => rule,
        }
    }

    pub fn into_rule(self) -> Rule {
        match self {
            Self::Created(rule) | Self::AlreadyExists(rule) => rule,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[async_trait]
pub trait RbacStore: Send + Sync {
    // Roles
    async fn list_roles(&self) -> RbacResult<Vec<Role>>;
    /// Return the role with this (case-insensitive) name, creating it if
    /// missing. The flag is true when the role was created.
    async fn ensure_role(&self, name: &str) -> RbacResult<(Role, bool)>;

    // User roles
    async fn user_role_ids(&self, user_id: &UserId) -> RbacResult<Vec<RoleId>>;
    async fn assign_user_role(&self, user_id: &UserId, role_id: RoleId) -> RbacResult<bool>;
    async fn revoke_user_role(&self, user_id: &UserId, role_id: RoleId) -> RbacResult<bool>;

    // Rules
    async fn list_rules(&self, service: &str) -> RbacResult<Vec<Rule>>;
    async fn find_rule(&self, service: &str, key: &RouteKey) -> RbacResult<Option<Rule>>;
    async fn get_rule(&self, rule_id: RuleId) -> RbacResult<Option<Rule>>;
    /// Insert a rule; never creates a second row for the same
    /// (path, method, service).
    async fn insert_rule(&self, rule: &NewRule) -> RbacResult<RuleInsert>;
    async fn update_rule_privacy(&self, rule_id: RuleId, is_private: bool) -> RbacResult<()>;
    async fn set_rule_policy(&self, rule_id: RuleId, policy: AccessPolicy) -> RbacResult<bool>;
    /// Delete rules and, with them, their permission rows.
    async fn delete_rules(&self, rule_ids: &[RuleId]) -> RbacResult<u64>;

    // Permissions
    async fn list_permissions(&self, service: &str) -> RbacResult<Vec<RulePermission>>;
    async fn rule_permissions(&self, rule_id: RuleId) -> RbacResult<Vec<RulePermission>>;
    /// Insert unless (rule, role) already has a row. True when inserted.
    async fn insert_permission(&self, permission: &RulePermission) -> RbacResult<bool>;
    async fn upsert_permission(&self, permission: &RulePermission) -> RbacResult<()>;
    async fn delete_permission(&self, rule_id: RuleId, role_id: RoleId) -> RbacResult<bool>;
    /// Permission rows whose rule no longer exists.
    async fn orphaned_permissions(&self) -> RbacResult<Vec<RulePermission>>;
    async fn delete_orphaned_permissions(&self) -> RbacResult<u64>;

    fn backend_name(&self) -> &'static str;
}

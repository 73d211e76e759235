//! PostgreSQL [`RbacStore`] backed by sqlx.
//!
//! Relies on the schema in `migrations/`: a unique index on `LOWER(roles.name)`,
//! `UNIQUE (path, method, service)` on rules, and `ON DELETE CASCADE` from
//! rules and roles to their dependent rows.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tracing::{debug, warn};

use super::{RbacStore, RuleInsert};
use crate::rbac::error::{RbacError, RbacResult};
use crate::rbac::models::{
    normalize_role_name, AccessPolicy, NewRule, Role, RoleId, RouteKey, Rule, RuleId,
    RulePermission, UserId,
};

#[derive(Debug, FromRow)]
struct RoleRow {
    id: i32,
    name: String,
    description: String,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role::new(row.id, &row.name).with_description(row.description)
    }
}

#[derive(Debug, FromRow)]
struct RuleRow {
    id: i32,
    method: String,
    path: String,
    service: String,
    is_private: bool,
    access_policy: i16,
}

impl TryFrom<RuleRow> for Rule {
    type Error = RbacError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let access_policy = AccessPolicy::from_i16(row.access_policy).ok_or_else(|| {
            RbacError::storage(format!(
                "rule {} has unknown access_policy {}",
                row.id, row.access_policy
            ))
        })?;
        Ok(Rule {
            id: RuleId(row.id),
            method: row.method,
            path: row.path,
            service: row.service,
            is_private: row.is_private,
            access_policy,
        })
    }
}

#[derive(Debug, FromRow)]
struct PermissionRow {
    rule_id: i32,
    role_id: i32,
    allowed: Option<bool>,
}

impl From<PermissionRow> for RulePermission {
    fn from(row: PermissionRow) -> Self {
        RulePermission::new(RuleId(row.rule_id), RoleId(row.role_id), row.allowed)
    }
}

fn rules_from_rows(rows: Vec<RuleRow>) -> RbacResult<Vec<Rule>> {
    rows.into_iter().map(Rule::try_from).collect()
}

/// Store over a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RbacStore for PgStore {
    async fn list_roles(&self) -> RbacResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            r#"SELECT id, name, description FROM roles ORDER BY id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn ensure_role(&self, name: &str) -> RbacResult<(Role, bool)> {
        let name = normalize_role_name(name);
        if name.is_empty() {
            return Err(RbacError::InvalidInput("role name must not be empty".into()));
        }

        let inserted = sqlx::query_as::<_, RoleRow>(
            r#"
            INSERT INTO roles (name) VALUES ($1)
            ON CONFLICT ((LOWER(name))) DO NOTHING
            RETURNING id, name, description
            "#,
        )
        .bind(&name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            debug!(role = %name, "Created role");
            return Ok((row.into(), true));
        }

        let row = sqlx::query_as::<_, RoleRow>(
            r#"SELECT id, name, description FROM roles WHERE LOWER(name) = $1"#,
        )
        .bind(&name)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.into(), false))
    }

    async fn user_role_ids(&self, user_id: &UserId) -> RbacResult<Vec<RoleId>> {
        let ids = sqlx::query_scalar::<_, i32>(
            r#"SELECT role_id FROM user_roles WHERE user_id = $1 ORDER BY role_id"#,
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(RoleId).collect())
    }

    async fn assign_user_role(&self, user_id: &UserId, role_id: RoleId) -> RbacResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"SELECT EXISTS(SELECT 1 FROM roles WHERE id = $1)"#,
        )
        .bind(role_id.0)
        .fetch_one(&self.pool)
        .await?;
        if !exists {
            return Err(RbacError::RoleNotFound(role_id.to_string()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2)
            ON CONFLICT (user_id, role_id) DO NOTHING
            "#,
        )
        .bind(user_id.as_str())
        .bind(role_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_user_role(&self, user_id: &UserId, role_id: RoleId) -> RbacResult<bool> {
        let result = sqlx::query(r#"DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2"#)
            .bind(user_id.as_str())
            .bind(role_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_rules(&self, service: &str) -> RbacResult<Vec<Rule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, method, path, service, is_private, access_policy
            FROM rules
            WHERE service = $1
            ORDER BY id
            "#,
        )
        .bind(service)
        .fetch_all(&self.pool)
        .await?;
        rules_from_rows(rows)
    }

    async fn find_rule(&self, service: &str, key: &RouteKey) -> RbacResult<Option<Rule>> {
        let row = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, method, path, service, is_private, access_policy
            FROM rules
            WHERE path = $1 AND method = $2 AND service = $3
            "#,
        )
        .bind(&key.path)
        .bind(&key.method)
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Rule::try_from).transpose()
    }

    async fn get_rule(&self, rule_id: RuleId) -> RbacResult<Option<Rule>> {
        let row = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, method, path, service, is_private, access_policy
            FROM rules
            WHERE id = $1
            "#,
        )
        .bind(rule_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Rule::try_from).transpose()
    }

    async fn insert_rule(&self, rule: &NewRule) -> RbacResult<RuleInsert> {
        let inserted = sqlx::query_as::<_, RuleRow>(
            r#"
            INSERT INTO rules (method, path, service, is_private, access_policy)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT ON CONSTRAINT rules_path_method_service_key DO NOTHING
            RETURNING id, method, path, service, is_private, access_policy
            "#,
        )
        .bind(&rule.method)
        .bind(&rule.path)
        .bind(&rule.service)
        .bind(rule.is_private)
        .bind(rule.access_policy.as_i16())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(RuleInsert::Created(row.try_into()?));
        }

        let key = RouteKey::new(&rule.method, &rule.path);
        match self.find_rule(&rule.service, &key).await? {
            Some(existing) => {
                warn!(route = %key, "Rule was created concurrently; reusing existing row");
                Ok(RuleInsert::AlreadyExists(existing))
            }
            None => Err(RbacError::storage(format!(
                "insert of {} conflicted but no row is visible",
                key
            ))),
        }
    }

    async fn update_rule_privacy(&self, rule_id: RuleId, is_private: bool) -> RbacResult<()> {
        let result = sqlx::query(r#"UPDATE rules SET is_private = $2 WHERE id = $1"#)
            .bind(rule_id.0)
            .bind(is_private)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RbacError::RuleNotFound(rule_id));
        }
        Ok(())
    }

    async fn set_rule_policy(&self, rule_id: RuleId, policy: AccessPolicy) -> RbacResult<bool> {
        let result = sqlx::query(r#"UPDATE rules SET access_policy = $2 WHERE id = $1"#)
            .bind(rule_id.0)
            .bind(policy.as_i16())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_rules(&self, rule_ids: &[RuleId]) -> RbacResult<u64> {
        if rule_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i32> = rule_ids.iter().map(|id| id.0).collect();

        let mut tx = self.pool.begin().await?;
        // The foreign key cascades too; deleting explicitly keeps the two
        // deletes in one transaction on schemas created without it.
        sqlx::query(r#"DELETE FROM rule_permissions WHERE rule_id = ANY($1)"#)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(r#"DELETE FROM rules WHERE id = ANY($1)"#)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn list_permissions(&self, service: &str) -> RbacResult<Vec<RulePermission>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            r#"
            SELECT rp.rule_id, rp.role_id, rp.allowed
            FROM rule_permissions rp
            JOIN rules r ON r.id = rp.rule_id
            WHERE r.service = $1
            ORDER BY rp.rule_id, rp.role_id
            "#,
        )
        .bind(service)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RulePermission::from).collect())
    }

    async fn rule_permissions(&self, rule_id: RuleId) -> RbacResult<Vec<RulePermission>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            r#"
            SELECT rule_id, role_id, allowed
            FROM rule_permissions
            WHERE rule_id = $1
            ORDER BY role_id
            "#,
        )
        .bind(rule_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RulePermission::from).collect())
    }

    async fn insert_permission(&self, permission: &RulePermission) -> RbacResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO rule_permissions (rule_id, role_id, allowed)
            VALUES ($1, $2, $3)
            ON CONFLICT (rule_id, role_id) DO NOTHING
            "#,
        )
        .bind(permission.rule_id.0)
        .bind(permission.role_id.0)
        .bind(permission.allowed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_permission(&self, permission: &RulePermission) -> RbacResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_permissions (rule_id, role_id, allowed)
            VALUES ($1, $2, $3)
            ON CONFLICT (rule_id, role_id) DO UPDATE SET allowed = EXCLUDED.allowed
            "#,
        )
        .bind(permission.rule_id.0)
        .bind(permission.role_id.0)
        .bind(permission.allowed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_permission(&self, rule_id: RuleId, role_id: RoleId) -> RbacResult<bool> {
        let result =
            sqlx::query(r#"DELETE FROM rule_permissions WHERE rule_id = $1 AND role_id = $2"#)
                .bind(rule_id.0)
                .bind(role_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn orphaned_permissions(&self) -> RbacResult<Vec<RulePermission>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            r#"
            SELECT rp.rule_id, rp.role_id, rp.allowed
            FROM rule_permissions rp
            LEFT JOIN rules r ON r.id = rp.rule_id
            WHERE r.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RulePermission::from).collect())
    }

    async fn delete_orphaned_permissions(&self) -> RbacResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM rule_permissions rp
            WHERE NOT EXISTS (SELECT 1 FROM rules r WHERE r.id = rp.rule_id)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

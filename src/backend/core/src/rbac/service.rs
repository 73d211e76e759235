//! The RBAC facade the application holds.
//!
//! [`Rbac`] owns the role directory, the rule registry, the evaluator and the
//! reconciler, all sharing one [`RbacStore`]. Every operation that writes
//! shared state (reloads, synchronization, default assignment, overrides)
//! takes the same async mutex, so at most one writer runs at a time per
//! process. Request-time evaluation never takes it.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::declare::{RbacRouter, RoleExpr, RouteDeclarer, Visibility};
use super::error::{RbacError, RbacResult};
use super::identity::IdentityResolver;
use super::middleware::PermissionLayer;
use super::models::{
    normalize_role_name, AccessPolicy, Role, RoleId, RouteKey, RouteSnapshot, Rule, RuleId,
    RulePermission, UserId,
};
use super::policy::{Caller, Evaluation, PermissionEvaluator};
use super::reconcile::{AssignReport, AssignStrategy, ConsistencyReport, ReconciliationEngine, SyncReport};
use super::registry::{RegistryLoad, RuleRegistry};
use super::roles::RoleStore;
use super::store::RbacStore;
use crate::config::RbacConfig;
use crate::telemetry::metrics::RegistryGauges;

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of [`Rbac::init`].
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub roles_created: Vec<String>,
    pub roles: usize,
    pub registry: RegistryLoad,
}

/// Result of [`Rbac::reload`].
#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub roles: usize,
    pub declarations_refreshed: usize,
    pub registry: RegistryLoad,
}

/// Result of [`Rbac::full_sync`].
#[derive(Debug, Clone, Serialize)]
pub struct FullSyncReport {
    pub sync: SyncReport,
    pub defaults: AssignReport,
    pub registry: RegistryLoad,
}

/// Result of [`Rbac::bootstrap_admin`].
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub user_id: UserId,
    pub role: Role,
    pub role_created: bool,
    pub assigned: bool,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Serialize)]
pub struct RbacStats {
    pub service: String,
    pub highest_role: String,
    pub highest_role_id: Option<RoleId>,
    pub roles: usize,
    pub committed_routes: usize,
    pub public_routes: usize,
    pub fresh_routes: usize,
    pub unassigned_routes_are_public: bool,
    pub store: &'static str,
}

/// Answer to "what would happen if this user called this route".
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub caller: Caller,
    pub role_names: Vec<String>,
    #[serde(flatten)]
    pub evaluation: Evaluation,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Facade
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared RBAC handle. Cloning is cheap.
#[derive(Clone)]
pub struct Rbac {
    config: Arc<RbacConfig>,
    store: Arc<dyn RbacStore>,
    roles: RoleStore,
    registry: RuleRegistry,
    evaluator: PermissionEvaluator,
    identity: IdentityResolver,
    engine: ReconciliationEngine,
    writer: Arc<Mutex<()>>,
}

impl Rbac {
    pub fn new(config: RbacConfig, store: Arc<dyn RbacStore>) -> RbacResult<Self> {
        config.validate()?;
        let roles = RoleStore::new(&config.highest_role);
        let registry = RuleRegistry::new();
        let evaluator = PermissionEvaluator::new(
            roles.clone(),
            registry.clone(),
            store.clone(),
            &config.service,
            config.unassigned_routes_are_public,
        );
        let identity = IdentityResolver::new(store.clone());
        let engine = ReconciliationEngine::new(store.clone(), registry.clone(), roles.clone(), &config.service);

        Ok(Self {
            config: Arc::new(config),
            store,
            roles,
            registry,
            evaluator,
            identity,
            engine,
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// Seed the default roles, then load roles and rules.
    ///
    /// Must succeed before routes are declared: declarations resolve role
    /// expressions against the roles loaded here.
    pub async fn init(&self) -> RbacResult<InitReport> {
        let created = self.seed_roles(&self.config.default_roles).await?;
        let _guard = self.writer.lock().await;
        let roles = self.roles.load(self.store.as_ref()).await?;
        let registry = self.registry.load_from_storage(self.store.as_ref(), &self.config.service).await?;
        info!(
            service = %self.config.service,
            roles = roles.len(),
            rules = registry.persisted,
            "RBAC initialized"
        );
        Ok(InitReport {
            roles_created: created.into_iter().map(|r| r.name).collect(),
            roles: roles.len(),
            registry,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Declaration
    // ─────────────────────────────────────────────────────────────────────────

    /// Guard layer for private routes.
    pub fn layer(&self) -> PermissionLayer {
        PermissionLayer::new(self.evaluator.clone(), self.identity.clone())
    }

    pub fn declarer(&self) -> RouteDeclarer {
        RouteDeclarer::new(self.registry.clone(), self.roles.clone(), self.config.service_root.clone())
    }

    /// Router builder whose routes are declared as they are added.
    pub fn router<S>(&self) -> RbacRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        RbacRouter::new(self.declarer(), self.layer())
    }

    /// Declare a route without mounting a handler.
    pub fn declare(&self, method: &str, path: &str, visibility: Visibility, expr: RoleExpr) -> RbacResult<RouteKey> {
        let method = axum::http::Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| RbacError::InvalidInput(format!("invalid HTTP method: {}", method)))?;
        Ok(self.declarer().declare(&method, path, visibility, expr))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reloads
    // ─────────────────────────────────────────────────────────────────────────

    /// Reload the role directory and re-resolve declared role expressions.
    pub async fn reload_roles(&self) -> RbacResult<usize> {
        let _guard = self.writer.lock().await;
        let (roles, _) = self.load_roles().await?;
        Ok(roles)
    }

    /// Rebuild the committed registry from storage.
    pub async fn reload_rules(&self) -> RbacResult<RegistryLoad> {
        let _guard = self.writer.lock().await;
        self.load_rules().await
    }

    /// Roles, then rules.
    pub async fn reload(&self) -> RbacResult<ReloadReport> {
        let _guard = self.writer.lock().await;
        let (roles, declarations_refreshed) = self.load_roles().await?;
        let registry = self.load_rules().await?;
        Ok(ReloadReport {
            roles,
            declarations_refreshed,
            registry,
        })
    }

    async fn load_roles(&self) -> RbacResult<(usize, usize)> {
        let roles = self.roles.load(self.store.as_ref()).await?;
        let refreshed = self.registry.refresh_declarations(&roles);
        Ok((roles.len(), refreshed))
    }

    async fn load_rules(&self) -> RbacResult<RegistryLoad> {
        let load = self
            .registry
            .load_from_storage(self.store.as_ref(), &self.config.service)
            .await?;
        RegistryGauges::set(
            self.roles.snapshot().len(),
            self.registry.snapshot().len(),
            self.registry.fresh_count(),
        );
        Ok(load)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reconciliation
    // ─────────────────────────────────────────────────────────────────────────

    /// One reconciliation pass within the configured deadline, then a rule
    /// reload.
    pub async fn synchronize(&self) -> RbacResult<SyncReport> {
        let _guard = self.writer.lock().await;
        let report = self.engine.synchronize_within(self.config.sync_timeout).await?;
        self.load_rules().await?;
        Ok(report)
    }

    /// Default assignment, then a rule reload.
    pub async fn assign_defaults(&self, strategy: &AssignStrategy) -> RbacResult<AssignReport> {
        let _guard = self.writer.lock().await;
        let report = self.engine.assign_defaults(strategy).await?;
        self.load_rules().await?;
        Ok(report)
    }

    /// Synchronize, assign defaults and reload rules as one operation.
    /// `deadline` bounds all three; the configured sync timeout applies when
    /// it is `None`.
    pub async fn full_sync(&self, strategy: &AssignStrategy, deadline: Option<Duration>) -> RbacResult<FullSyncReport> {
        let deadline = deadline.unwrap_or(self.config.sync_timeout);
        let _guard = self.writer.lock().await;
        let run = async {
            let sync = self.engine.synchronize().await?;
            let defaults = self.engine.assign_defaults(strategy).await?;
            let registry = self.load_rules().await?;
            Ok::<_, RbacError>(FullSyncReport {
                sync,
                defaults,
                registry,
            })
        };
        match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?deadline, "Full sync exceeded its deadline");
                Err(RbacError::DeadlineExceeded(deadline))
            }
        }
    }

    pub async fn consistency_report(&self) -> RbacResult<ConsistencyReport> {
        self.engine.consistency_report().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Roles
    // ─────────────────────────────────────────────────────────────────────────

    /// Ensure each named role exists. Returns the roles that were created.
    pub async fn seed_roles(&self, names: &[String]) -> RbacResult<Vec<Role>> {
        let mut created = Vec::new();
        {
            let _guard = self.writer.lock().await;
            for name in names {
                let name = normalize_role_name(name);
                if name.is_empty() {
                    continue;
                }
                let (role, was_created) = self.store.ensure_role(&name).await?;
                if was_created {
                    info!(role = %role.name, role_id = %role.id, "Role created");
                    created.push(role);
                }
            }
            if !created.is_empty() {
                self.load_roles().await?;
            }
        }
        Ok(created)
    }

    /// Create a role if it does not exist. Returns it and whether it was new.
    pub async fn create_role(&self, name: &str) -> RbacResult<(Role, bool)> {
        let name = normalize_role_name(name);
        if name.is_empty() {
            return Err(RbacError::InvalidInput("role name must not be empty".into()));
        }
        let _guard = self.writer.lock().await;
        let (role, created) = self.store.ensure_role(&name).await?;
        if created {
            self.load_roles().await?;
        }
        Ok((role, created))
    }

    /// Roles currently loaded, by id.
    pub fn list_roles(&self) -> Vec<Role> {
        self.roles.snapshot().roles().cloned().collect()
    }

    /// Make sure the highest-privilege role exists and `user_id` holds it.
    pub async fn bootstrap_admin(&self, user_id: &UserId) -> RbacResult<BootstrapReport> {
        if user_id.as_str().trim().is_empty() {
            return Err(RbacError::InvalidInput("user id must not be empty".into()));
        }
        let _guard = self.writer.lock().await;
        let (role, role_created) = self.store.ensure_role(&self.config.highest_role).await?;
        if role_created {
            self.load_roles().await?;
        }
        let assigned = self.store.assign_user_role(user_id, role.id).await?;
        info!(user_id = %user_id, role = %role.name, assigned, "Admin bootstrapped");
        Ok(BootstrapReport {
            user_id: user_id.clone(),
            role,
            role_created,
            assigned,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // User roles
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn user_roles(&self, user_id: &UserId) -> RbacResult<Vec<Role>> {
        let roles = self.roles.snapshot();
        let ids = self.store.user_role_ids(user_id).await?;
        Ok(ids.into_iter().filter_map(|id| roles.get(id).cloned()).collect())
    }

    pub async fn assign_role(&self, user_id: &UserId, role_id: RoleId) -> RbacResult<bool> {
        self.require_role(role_id)?;
        self.store.assign_user_role(user_id, role_id).await
    }

    pub async fn revoke_role(&self, user_id: &UserId, role_id: RoleId) -> RbacResult<bool> {
        self.require_role(role_id)?;
        self.store.revoke_user_role(user_id, role_id).await
    }

    fn require_role(&self, role_id: RoleId) -> RbacResult<()> {
        if self.roles.snapshot().contains(role_id) {
            Ok(())
        } else {
            Err(RbacError::RoleNotFound(role_id.to_string()))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Rules and overrides
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn list_rules(&self) -> RbacResult<Vec<Rule>> {
        self.store.list_rules(&self.config.service).await
    }

    pub async fn rule_permissions(&self, rule_id: RuleId) -> RbacResult<Vec<RulePermission>> {
        self.require_rule(rule_id).await?;
        self.store.rule_permissions(rule_id).await
    }

    /// Set a per-role override. `None` defers to the rule's policy.
    pub async fn set_override(&self, rule_id: RuleId, role_id: RoleId, allowed: Option<bool>) -> RbacResult<()> {
        self.require_role(role_id)?;
        let _guard = self.writer.lock().await;
        self.require_rule(rule_id).await?;
        self.store
            .upsert_permission(&RulePermission::new(rule_id, role_id, allowed))
            .await?;
        self.registry.apply_permission(rule_id, role_id, Some(allowed));
        info!(rule_id = %rule_id, role_id = %role_id, ?allowed, "Override set");
        Ok(())
    }

    /// Remove a per-role override row.
    pub async fn clear_override(&self, rule_id: RuleId, role_id: RoleId) -> RbacResult<()> {
        let _guard = self.writer.lock().await;
        if !self.store.delete_permission(rule_id, role_id).await? {
            return Err(RbacError::PermissionNotFound {
                rule: rule_id,
                role: role_id,
            });
        }
        self.registry.apply_permission(rule_id, role_id, None);
        info!(rule_id = %rule_id, role_id = %role_id, "Override cleared");
        Ok(())
    }

    pub async fn set_policy(&self, rule_id: RuleId, policy: AccessPolicy) -> RbacResult<()> {
        let _guard = self.writer.lock().await;
        if !self.store.set_rule_policy(rule_id, policy).await? {
            return Err(RbacError::RuleNotFound(rule_id));
        }
        self.registry.apply_policy(rule_id, policy);
        info!(rule_id = %rule_id, policy = %policy, "Rule policy set");
        Ok(())
    }

    async fn require_rule(&self, rule_id: RuleId) -> RbacResult<Rule> {
        self.store
            .get_rule(rule_id)
            .await?
            .ok_or(RbacError::RuleNotFound(rule_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> RbacStats {
        let roles = self.roles.snapshot();
        let registry = self.registry.snapshot();
        RbacStats {
            service: self.config.service.clone(),
            highest_role: self.roles.highest_role_name().to_string(),
            highest_role_id: roles.highest(),
            roles: roles.len(),
            committed_routes: registry.len(),
            public_routes: registry.public_count(),
            fresh_routes: self.registry.fresh_count(),
            unassigned_routes_are_public: self.config.unassigned_routes_are_public,
            store: self.store.backend_name(),
        }
    }

    /// Committed routes ordered by path then method.
    pub fn routes(&self) -> Vec<RouteSnapshot> {
        self.registry.snapshot().routes().into_iter().cloned().collect()
    }

    /// Evaluate `method path` for `user_id` (anonymous when `None`) and
    /// report what the decision was based on.
    pub async fn explain(&self, user_id: Option<&UserId>, method: &str, path: &str) -> RbacResult<Explanation> {
        let caller = self.identity.resolve(user_id).await?;
        let roles = self.roles.snapshot();
        let role_names = caller
            .roles
            .iter()
            .filter_map(|id| roles.name_of(*id).map(str::to_string))
            .collect();
        let path = self.declarer().qualify(path);
        let evaluation = self.evaluator.evaluate_detailed(method, &path, &caller).await?;
        Ok(Explanation {
            caller,
            role_names,
            evaluation,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &RbacConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RbacStore> {
        &self.store
    }

    pub fn roles(&self) -> &RoleStore {
        &self.roles
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn evaluator(&self) -> &PermissionEvaluator {
        &self.evaluator
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }
}

impl std::fmt::Debug for Rbac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rbac")
            .field("service", &self.config.service)
            .field("roles", &self.roles)
            .field("registry", &self.registry)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::policy::{AllowReason, Decision, DenyReason};
    use crate::rbac::store::MemoryStore;

    async fn rbac_with(store: Arc<MemoryStore>) -> Rbac {
        let config = RbacConfig {
            service: "svc".into(),
            default_roles: vec!["admin".into(), "editor".into(), "viewer".into()],
            ..Default::default()
        };
        let rbac = Rbac::new(config, store).unwrap();
        rbac.init().await.unwrap();
        rbac
    }

    #[tokio::test]
    async fn test_init_seeds_default_roles() {
        let store = Arc::new(MemoryStore::new());
        let rbac = rbac_with(store.clone()).await;
        let names: Vec<_> = rbac.list_roles().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["admin", "editor", "viewer"]);
        assert_eq!(rbac.stats().highest_role_id, Some(RoleId(1)));

        let again = rbac.seed_roles(&["Admin".to_string()]).await.unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = RbacConfig {
            service_root: "api".into(),
            ..Default::default()
        };
        assert!(matches!(
            Rbac::new(config, Arc::new(MemoryStore::new())),
            Err(RbacError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_override_takes_effect_immediately() {
        let store = Arc::new(MemoryStore::new());
        let rbac = rbac_with(store.clone()).await;
        rbac.declare("GET", "/rules", Visibility::Private, RoleExpr::protected()).unwrap();
        rbac.synchronize().await.unwrap();

        let rule = rbac.list_rules().await.unwrap().remove(0);
        let editor = Caller::authenticated("u2", [RoleId(2)]);
        let deny = rbac.evaluator().evaluate("GET", "/api/rules", &editor).await.unwrap();
        assert_eq!(deny, Decision::Deny(DenyReason::ImplicitDeny));

        rbac.set_override(rule.id, RoleId(2), Some(true)).await.unwrap();
        let allow = rbac.evaluator().evaluate("GET", "/api/rules", &editor).await.unwrap();
        assert_eq!(allow, Decision::Allow(AllowReason::ExplicitGrant));

        rbac.clear_override(rule.id, RoleId(2)).await.unwrap();
        assert!(rbac.evaluator().evaluate("GET", "/api/rules", &editor).await.unwrap().is_denied());
        assert!(matches!(
            rbac.clear_override(rule.id, RoleId(2)).await,
            Err(RbacError::PermissionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_policy_unknown_rule() {
        let rbac = rbac_with(Arc::new(MemoryStore::new())).await;
        assert!(matches!(
            rbac.set_policy(RuleId(77), AccessPolicy::AllowAll).await,
            Err(RbacError::RuleNotFound(RuleId(77)))
        ));
    }

    #[tokio::test]
    async fn test_set_override_unknown_role() {
        let rbac = rbac_with(Arc::new(MemoryStore::new())).await;
        assert!(matches!(
            rbac.set_override(RuleId(1), RoleId(99), Some(true)).await,
            Err(RbacError::RoleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_admin_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let rbac = Rbac::new(
            RbacConfig {
                default_roles: vec![],
                ..Default::default()
            },
            store.clone(),
        )
        .unwrap();
        rbac.init().await.unwrap();

        let user = UserId::new("a1");
        let first = rbac.bootstrap_admin(&user).await.unwrap();
        assert!(first.role_created);
        assert!(first.assigned);
        let second = rbac.bootstrap_admin(&user).await.unwrap();
        assert!(!second.role_created);
        assert!(!second.assigned);

        let roles = rbac.user_roles(&user).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "admin");
    }

    #[tokio::test]
    async fn test_reload_roles_refreshes_declarations() {
        let store = Arc::new(MemoryStore::new());
        let rbac = rbac_with(store.clone()).await;
        rbac.declare("GET", "/feed", Visibility::Private, RoleExpr::AllowAll).unwrap();

        store.ensure_role("guest").await.unwrap();
        let report = rbac.reload().await.unwrap();
        assert_eq!(report.roles, 4);
        assert_eq!(report.declarations_refreshed, 1);

        let sync = rbac.synchronize().await.unwrap();
        assert_eq!(sync.permissions_seeded, 4);
    }

    #[tokio::test]
    async fn test_full_sync_assigns_defaults_and_reloads() {
        let rbac = rbac_with(Arc::new(MemoryStore::new())).await;
        rbac.declare("GET", "/reports", Visibility::Private, RoleExpr::protected()).unwrap();
        rbac.declare("GET", "/health", Visibility::Public, RoleExpr::AllowAll).unwrap();

        let report = rbac.full_sync(&AssignStrategy::ByPolicy, None).await.unwrap();
        assert_eq!(report.sync.created, 2);
        assert_eq!(report.defaults.rules_assigned, 1);
        assert_eq!(report.registry.persisted, 2);
        assert!(rbac.routes().iter().all(|r| r.is_persisted()));
        assert!(rbac.consistency_report().await.unwrap().is_healthy);
    }

    #[tokio::test]
    async fn test_explain_reports_source() {
        let store = Arc::new(MemoryStore::new());
        let rbac = rbac_with(store.clone()).await;
        rbac.declare("GET", "/rules", Visibility::Private, RoleExpr::allow([2])).unwrap();
        let user = UserId::new("u2");
        rbac.assign_role(&user, RoleId(2)).await.unwrap();

        let explanation = rbac.explain(Some(&user), "get", "/rules").await.unwrap();
        assert_eq!(explanation.role_names, vec!["editor"]);
        assert_eq!(explanation.evaluation.route, RouteKey::new("GET", "/api/rules"));
        assert!(explanation.evaluation.decision.is_allowed());
    }

    #[tokio::test]
    async fn test_assign_unknown_role_fails() {
        let rbac = rbac_with(Arc::new(MemoryStore::new())).await;
        assert!(matches!(
            rbac.assign_role(&UserId::new("u"), RoleId(42)).await,
            Err(RbacError::RoleNotFound(_))
        ));
    }
}

//! Route → rule lookup table.
//!
//! The registry has two parts:
//!
//! - the **committed** snapshot, read by every request. It is an immutable
//!   [`RegistrySnapshot`] behind an [`ArcSwap`]; writers build a replacement
//!   and swap it in, so readers never see a half-built table and never lock.
//! - the **fresh** set: every route the running code has declared. It is the
//!   reconciler's answer to "what should exist".
//!
//! Declarations land in both. [`RuleRegistry::load_from_storage`] rebuilds the
//! committed snapshot from persisted rules; routes that are declared but not
//! persisted yet are laid back on top so they keep their declared policy until
//! the next reconciliation.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::declare::{ResolvedAccess, RoleExpr};
use super::error::RbacResult;
use super::models::{AccessPolicy, RoleId, RouteKey, RouteSnapshot, RuleId, RulePermission};
use super::roles::RoleSnapshot;
use super::store::RbacStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Declared routes
// ═══════════════════════════════════════════════════════════════════════════════

/// A route as declared by application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredRoute {
    pub key: RouteKey,
    pub is_private: bool,
    pub expr: RoleExpr,
    /// `expr` resolved against the roles known when it was last resolved.
    pub access: ResolvedAccess,
}

impl DeclaredRoute {
    pub fn new(key: RouteKey, is_private: bool, expr: RoleExpr, roles: &RoleSnapshot) -> Self {
        let access = expr.resolve(roles);
        Self {
            key,
            is_private,
            expr,
            access,
        }
    }

    pub fn access_policy(&self) -> AccessPolicy {
        self.access.policy
    }

    /// Snapshot used before the route has a persisted rule.
    pub fn to_snapshot(&self) -> RouteSnapshot {
        RouteSnapshot {
            key: self.key.clone(),
            rule_id: None,
            is_private: self.is_private,
            access_policy: self.access.policy,
            roles: self
                .access
                .roles
                .iter()
                .map(|(role, allowed)| (*role, Some(*allowed)))
                .collect(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Committed snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable route table plus the public-route index.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    routes: HashMap<RouteKey, RouteSnapshot>,
    public: HashSet<RouteKey>,
}

impl RegistrySnapshot {
    pub fn get(&self, key: &RouteKey) -> Option<&RouteSnapshot> {
        self.routes.get(key)
    }

    pub fn is_public(&self, key: &RouteKey) -> bool {
        self.public.contains(key)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn public_count(&self) -> usize {
        self.public.len()
    }

    /// Routes ordered by path then method.
    pub fn routes(&self) -> Vec<&RouteSnapshot> {
        let mut routes: Vec<_> = self.routes.values().collect();
        routes.sort_by(|a, b| (&a.key.path, &a.key.method).cmp(&(&b.key.path, &b.key.method)));
        routes
    }

    pub fn find_rule(&self, rule_id: RuleId) -> Option<&RouteSnapshot> {
        self.routes.values().find(|r| r.rule_id == Some(rule_id))
    }

    fn insert(&mut self, route: RouteSnapshot) {
        if route.is_private {
            self.public.remove(&route.key);
        } else {
            self.public.insert(route.key.clone());
        }
        self.routes.insert(route.key.clone(), route);
    }

    /// Record a declaration. A persisted entry keeps its rule id, policy and
    /// overrides; only privacy follows the code.
    fn apply_declaration(&mut self, declared: &DeclaredRoute) {
        let next = match self.routes.get(&declared.key) {
            Some(existing) if existing.is_persisted() => RouteSnapshot {
                is_private: declared.is_private,
                ..existing.clone()
            },
            _ => declared.to_snapshot(),
        };
        self.insert(next);
    }

    fn rule_key(&self, rule_id: RuleId) -> Option<RouteKey> {
        self.find_rule(rule_id).map(|r| r.key.clone())
    }
}

/// What [`RuleRegistry::load_from_storage`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryLoad {
    pub persisted: usize,
    pub declared_only: usize,
    pub public: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared handle to the route registry. Cloning is cheap.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    committed: Arc<ArcSwap<RegistrySnapshot>>,
    fresh: Arc<Mutex<BTreeMap<RouteKey, DeclaredRoute>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current committed snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.committed.load_full()
    }

    /// Register a declared route in both the fresh set and the committed table.
    pub fn declare(&self, route: DeclaredRoute) {
        debug!(
            route = %route.key,
            is_private = route.is_private,
            policy = %route.access.policy,
            "Route declared"
        );
        self.committed.rcu(|current| {
            let mut next = RegistrySnapshot::clone(current);
            next.apply_declaration(&route);
            next
        });
        self.fresh.lock().insert(route.key.clone(), route);
    }

    /// Declared routes, ordered by key.
    pub fn fresh_routes(&self) -> Vec<DeclaredRoute> {
        self.fresh.lock().values().cloned().collect()
    }

    pub fn fresh_count(&self) -> usize {
        self.fresh.lock().len()
    }

    pub fn is_fresh(&self, key: &RouteKey) -> bool {
        self.fresh.lock().contains_key(key)
    }

    /// Forget every declaration; the committed table is untouched.
    pub fn clear_fresh(&self) {
        let cleared = {
            let mut fresh = self.fresh.lock();
            let n = fresh.len();
            fresh.clear();
            n
        };
        debug!(cleared, "Fresh route set cleared");
    }

    /// Rebuild the committed table from every rule of `service` and its
    /// permission rows.
    ///
    /// On failure the previous table stays in place.
    pub async fn load_from_storage(
        &self,
        store: &dyn RbacStore,
        service: &str,
    ) -> RbacResult<RegistryLoad> {
        let rules = store.list_rules(service).await?;
        let permissions = store.list_permissions(service).await?;

        let mut by_rule: HashMap<RuleId, Vec<RulePermission>> = HashMap::new();
        for permission in permissions {
            by_rule.entry(permission.rule_id).or_default().push(permission);
        }

        let mut next = RegistrySnapshot::default();
        for rule in &rules {
            let rows = by_rule.get(&rule.id).map(Vec::as_slice).unwrap_or(&[]);
            next.insert(RouteSnapshot::from_rule(rule, rows));
        }

        let persisted = next.len();
        let mut declared_only = 0;
        for declared in self.fresh.lock().values() {
            if next.get(&declared.key).is_none() {
                next.insert(declared.to_snapshot());
                declared_only += 1;
            }
        }

        let load = RegistryLoad {
            persisted,
            declared_only,
            public: next.public_count(),
        };
        self.committed.store(Arc::new(next));
        info!(
            service,
            persisted = load.persisted,
            declared_only = load.declared_only,
            public = load.public,
            "Rule registry loaded"
        );
        Ok(load)
    }

    /// Resolve every declared role expression again against `roles`.
    ///
    /// Declarations resolve their expression once, against the roles known
    /// at that moment. Calling this after the role directory is reloaded
    /// closes that window for routes that are not persisted yet; persisted
    /// routes take their overrides from storage and are left alone.
    pub fn refresh_declarations(&self, roles: &RoleSnapshot) -> usize {
        let refreshed: Vec<DeclaredRoute> = {
            let mut fresh = self.fresh.lock();
            for declared in fresh.values_mut() {
                declared.access = declared.expr.resolve(roles);
            }
            fresh.values().cloned().collect()
        };

        self.committed.rcu(|current| {
            let mut next = RegistrySnapshot::clone(current);
            for declared in &refreshed {
                if !next.get(&declared.key).map(|r| r.is_persisted()).unwrap_or(false) {
                    next.insert(declared.to_snapshot());
                }
            }
            next
        });
        refreshed.len()
    }

    /// Patch one override in the committed table. `None` removes the row.
    pub fn apply_permission(&self, rule_id: RuleId, role_id: RoleId, allowed: Option<Option<bool>>) -> bool {
        let mut patched = false;
        self.committed.rcu(|current| {
            let mut next = RegistrySnapshot::clone(current);
            patched = false;
            if let Some(key) = next.rule_key(rule_id) {
                if let Some(route) = next.routes.get_mut(&key) {
                    match allowed {
                        Some(value) => {
                            route.roles.insert(role_id, value);
                        }
                        None => {
                            route.roles.remove(&role_id);
                        }
                    }
                    patched = true;
                }
            }
            next
        });
        patched
    }

    /// Patch the access policy of one rule in the committed table.
    pub fn apply_policy(&self, rule_id: RuleId, policy: AccessPolicy) -> bool {
        let mut patched = false;
        self.committed.rcu(|current| {
            let mut next = RegistrySnapshot::clone(current);
            patched = false;
            if let Some(key) = next.rule_key(rule_id) {
                if let Some(route) = next.routes.get_mut(&key) {
                    route.access_policy = policy;
                    patched = true;
                }
            }
            next
        });
        patched
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("committed", &self.committed.load().len())
            .field("fresh", &self.fresh.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::models::{NewRule, Role};
    use crate::rbac::store::MemoryStore;

    fn roles() -> RoleSnapshot {
        RoleSnapshot::new(
            vec![Role::new(1, "admin"), Role::new(2, "editor"), Role::new(3, "viewer")],
            "admin",
        )
    }

    fn declared(method: &str, path: &str, is_private: bool, expr: RoleExpr) -> DeclaredRoute {
        DeclaredRoute::new(RouteKey::new(method, path), is_private, expr, &roles())
    }

    #[test]
    fn test_declare_populates_committed_and_fresh() {
        let registry = RuleRegistry::new();
        registry.declare(declared("GET", "/api/rules", true, RoleExpr::allow([2])));
        registry.declare(declared("GET", "/api/health", false, RoleExpr::AllowAll));

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.public_count(), 1);
        assert!(snap.is_public(&RouteKey::new("GET", "/api/health")));

        let rules = snap.get(&RouteKey::new("GET", "/api/rules")).unwrap();
        assert!(!rules.is_persisted());
        assert_eq!(rules.override_for(crate::rbac::models::RoleId(2)), Some(true));
        assert_eq!(registry.fresh_count(), 2);
    }

    #[test]
    fn test_clear_fresh_keeps_committed() {
        let registry = RuleRegistry::new();
        registry.declare(declared("GET", "/api/a", true, RoleExpr::AllowAll));
        registry.clear_fresh();
        assert_eq!(registry.fresh_count(), 0);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_readers_keep_old_snapshot_across_swap() {
        let registry = RuleRegistry::new();
        registry.declare(declared("GET", "/api/a", true, RoleExpr::AllowAll));
        let held = registry.snapshot();
        registry.declare(declared("GET", "/api/b", true, RoleExpr::AllowAll));
        assert_eq!(held.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_load_from_storage_rebuilds_and_overlays_declared() {
        let store = MemoryStore::with_roles(["admin", "editor"]);
        let rule = store
            .insert_rule(&NewRule {
                method: "GET".into(),
                path: "/api/rules".into(),
                service: "svc".into(),
                is_private: true,
                access_policy: AccessPolicy::Protected,
            })
            .await
            .unwrap()
            .into_rule();
        store
            .insert_permission(&RulePermission::new(rule.id, RoleId(2), Some(true)))
            .await
            .unwrap();

        let registry = RuleRegistry::new();
        registry.declare(declared("GET", "/api/pending", true, RoleExpr::ForbidAll));

        let load = registry.load_from_storage(&store, "svc").await.unwrap();
        assert_eq!(load.persisted, 1);
        assert_eq!(load.declared_only, 1);

        let snap = registry.snapshot();
        let persisted = snap.get(&RouteKey::new("GET", "/api/rules")).unwrap();
        assert_eq!(persisted.rule_id, Some(rule.id));
        assert_eq!(persisted.override_for(RoleId(2)), Some(true));
        assert!(!snap.get(&RouteKey::new("GET", "/api/pending")).unwrap().is_persisted());
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_table() {
        let store = MemoryStore::new();
        let registry = RuleRegistry::new();
        registry.declare(declared("GET", "/api/a", true, RoleExpr::AllowAll));

        store.set_unavailable(true);
        assert!(registry.load_from_storage(&store, "svc").await.is_err());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_declaration_keeps_persisted_overrides() {
        let store = MemoryStore::with_roles(["admin", "editor"]);
        let rule = store
            .insert_rule(&NewRule {
                method: "GET".into(),
                path: "/api/rules".into(),
                service: "svc".into(),
                is_private: true,
                access_policy: AccessPolicy::Protected,
            })
            .await
            .unwrap()
            .into_rule();
        store
            .insert_permission(&RulePermission::new(rule.id, RoleId(2), Some(false)))
            .await
            .unwrap();

        let registry = RuleRegistry::new();
        registry.load_from_storage(&store, "svc").await.unwrap();
        registry.declare(declared("GET", "/api/rules", true, RoleExpr::allow([2])));

        let snap = registry.snapshot();
        let route = snap.get(&RouteKey::new("GET", "/api/rules")).unwrap();
        assert_eq!(route.rule_id, Some(rule.id));
        assert_eq!(route.override_for(RoleId(2)), Some(false));
    }

    #[test]
    fn test_refresh_declarations_picks_up_new_roles() {
        let registry = RuleRegistry::new();
        let before = RoleSnapshot::new(vec![Role::new(1, "admin")], "admin");
        registry.declare(DeclaredRoute::new(
            RouteKey::new("GET", "/api/a"),
            true,
            RoleExpr::AllowAll,
            &before,
        ));
        assert_eq!(
            registry.snapshot().get(&RouteKey::new("GET", "/api/a")).unwrap().roles.len(),
            1
        );

        assert_eq!(registry.refresh_declarations(&roles()), 1);
        assert_eq!(
            registry.snapshot().get(&RouteKey::new("GET", "/api/a")).unwrap().roles.len(),
            3
        );
    }

    #[tokio::test]
    async fn test_apply_permission_and_policy_patch_persisted_rule() {
        let store = MemoryStore::with_roles(["admin", "editor"]);
        let rule = store
            .insert_rule(&NewRule {
                method: "GET".into(),
                path: "/api/rules".into(),
                service: "svc".into(),
                is_private: true,
                access_policy: AccessPolicy::Protected,
            })
            .await
            .unwrap()
            .into_rule();
        let registry = RuleRegistry::new();
        registry.load_from_storage(&store, "svc").await.unwrap();

        assert!(registry.apply_permission(rule.id, RoleId(2), Some(Some(true))));
        assert!(registry.apply_policy(rule.id, AccessPolicy::ForbidAll));
        let snap = registry.snapshot();
        let route = snap.find_rule(rule.id).unwrap();
        assert_eq!(route.override_for(RoleId(2)), Some(true));
        assert_eq!(route.access_policy, AccessPolicy::ForbidAll);

        assert!(registry.apply_permission(rule.id, RoleId(2), None));
        assert!(registry.snapshot().find_rule(rule.id).unwrap().roles.is_empty());
        assert!(!registry.apply_policy(RuleId(404), AccessPolicy::AllowAll));
    }
}

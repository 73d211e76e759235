//! Route declaration: wire a handler and register its access metadata in one
//! call.
//!
//! ```rust,ignore
//! let router = rbac
//!     .router()
//!     .get("/health", Visibility::Public, RoleExpr::AllowAll, health)
//!     .get("/rules", Visibility::Private, RoleExpr::allow([2]), list_rules)
//!     .delete("/rules/:rule_id", Visibility::Private, RoleExpr::ForbidAll, delete_rule)
//!     .into_router();
//! ```
//!
//! Paths are qualified with the service root (`/api` by default) and have
//! repeated slashes collapsed before they are registered with axum, so the
//! template axum reports as the matched path is exactly the registry key.
//!
//! Role expressions are resolved against the role directory at declaration
//! time. A role created afterwards is not part of an `AllowAll` or `Forbid`
//! set until [`RuleRegistry::refresh_declarations`] runs, which
//! [`Rbac::reload_roles`](super::Rbac::reload_roles) does.

use axum::{
    handler::Handler,
    http::Method,
    routing::{self, MethodRouter},
    Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use tracing::warn;

use super::middleware::PermissionLayer;
use super::models::{qualify_path, AccessPolicy, RoleId, RouteKey, ANY_METHODS};
use super::registry::{DeclaredRoute, RuleRegistry};
use super::roles::{RoleSnapshot, RoleStore};

// ═══════════════════════════════════════════════════════════════════════════════
// Role expressions
// ═══════════════════════════════════════════════════════════════════════════════

/// Who may call a route, as written at the declaration site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleExpr {
    /// Only these roles (plus the highest-privilege role).
    Allow(Vec<RoleId>),
    /// Only the roles with these names; unknown names are skipped.
    AllowNamed(Vec<String>),
    /// Every authenticated caller.
    AllowAll,
    /// Every known role except these.
    Forbid(Vec<RoleId>),
    /// Nobody except the highest-privilege role.
    ForbidAll,
}

impl RoleExpr {
    pub fn allow<I, R>(roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RoleId>,
    {
        Self::Allow(roles.into_iter().map(Into::into).collect())
    }

    pub fn allow_named<I, N>(names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self::AllowNamed(names.into_iter().map(Into::into).collect())
    }

    pub fn forbid<I, R>(roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RoleId>,
    {
        Self::Forbid(roles.into_iter().map(Into::into).collect())
    }

    /// Protected with no code-side grants: only overrides set by an
    /// administrator (and the highest-privilege role) get through.
    pub fn protected() -> Self {
        Self::Allow(Vec::new())
    }

    /// Resolve to a blanket policy plus explicit per-role values.
    pub fn resolve(&self, roles: &RoleSnapshot) -> ResolvedAccess {
        match self {
            Self::Allow(ids) => ResolvedAccess {
                policy: AccessPolicy::Protected,
                roles: ids.iter().map(|id| (*id, true)).collect(),
            },
            Self::AllowNamed(names) => ResolvedAccess {
                policy: AccessPolicy::Protected,
                roles: names
                    .iter()
                    .filter_map(|name| {
                        let id = roles.lookup(name);
                        if id.is_none() {
                            warn!(role = %name, "Unknown role in route declaration; skipped");
                        }
                        id
                    })
                    .map(|id| (id, true))
                    .collect(),
            },
            Self::AllowAll => ResolvedAccess {
                policy: AccessPolicy::AllowAll,
                roles: roles.ids().into_iter().map(|id| (id, true)).collect(),
            },
            Self::Forbid(denied) => ResolvedAccess {
                policy: AccessPolicy::Protected,
                roles: roles
                    .ids()
                    .into_iter()
                    .map(|id| (id, !denied.contains(&id)))
                    .chain(denied.iter().map(|id| (*id, false)))
                    .collect(),
            },
            Self::ForbidAll => ResolvedAccess {
                policy: AccessPolicy::ForbidAll,
                roles: roles.ids().into_iter().map(|id| (id, false)).collect(),
            },
        }
    }
}

/// A role expression after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ResolvedAccess {
    pub policy: AccessPolicy,
    pub roles: BTreeMap<RoleId, bool>,
}

/// Whether a route needs the permission guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn is_private(self) -> bool {
        matches!(self, Self::Private)
    }
}

impl From<bool> for Visibility {
    fn from(is_private: bool) -> Self {
        if is_private {
            Self::Private
        } else {
            Self::Public
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Declarer
// ═══════════════════════════════════════════════════════════════════════════════

/// Registers routes in the rule registry without wiring a handler.
#[derive(Clone, Debug)]
pub struct RouteDeclarer {
    registry: RuleRegistry,
    roles: RoleStore,
    service_root: String,
}

impl RouteDeclarer {
    pub fn new(registry: RuleRegistry, roles: RoleStore, service_root: impl Into<String>) -> Self {
        Self {
            registry,
            roles,
            service_root: service_root.into(),
        }
    }

    /// Fully qualified template path for `path`.
    pub fn qualify(&self, path: &str) -> String {
        qualify_path(&self.service_root, path)
    }

    /// Declare one (method, path). Returns the registry key.
    pub fn declare(
        &self,
        method: &Method,
        path: &str,
        visibility: Visibility,
        expr: RoleExpr,
    ) -> RouteKey {
        let key = RouteKey::new(method.as_str(), self.qualify(path));
        let roles = self.roles.snapshot();
        self.registry.declare(DeclaredRoute::new(
            key.clone(),
            visibility.is_private(),
            expr,
            &roles,
        ));
        key
    }

    /// Declare the same path for every method in [`ANY_METHODS`].
    pub fn declare_any(&self, path: &str, visibility: Visibility, expr: RoleExpr) -> Vec<RouteKey> {
        let roles = self.roles.snapshot();
        let path = self.qualify(path);
        ANY_METHODS
            .iter()
            .map(|method| {
                let key = RouteKey::new(method, &path);
                self.registry.declare(DeclaredRoute::new(
                    key.clone(),
                    visibility.is_private(),
                    expr.clone(),
                    &roles,
                ));
                key
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Router builder
// ═══════════════════════════════════════════════════════════════════════════════

/// An axum router whose routes are declared to the RBAC registry as they are
/// added. Private routes get the permission guard as a route layer.
pub struct RbacRouter<S = ()> {
    router: Router<S>,
    declarer: RouteDeclarer,
    guard: PermissionLayer,
}

impl<S> RbacRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(declarer: RouteDeclarer, guard: PermissionLayer) -> Self {
        Self {
            router: Router::new(),
            declarer,
            guard,
        }
    }

    /// Declare `method path` and mount `handler` for it.
    pub fn route(
        mut self,
        method: Method,
        path: &str,
        visibility: Visibility,
        expr: RoleExpr,
        method_router: MethodRouter<S, Infallible>,
    ) -> Self {
        let key = self.declarer.declare(&method, path, visibility, expr);
        let guarded = self.guarded(method_router, visibility);
        self.router = self.router.route(&key.path, guarded);
        self
    }

    pub fn get<H, T>(self, path: &str, visibility: Visibility, expr: RoleExpr, handler: H) -> Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        self.route(Method::GET, path, visibility, expr, routing::get(handler))
    }

    pub fn post<H, T>(self, path: &str, visibility: Visibility, expr: RoleExpr, handler: H) -> Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        self.route(Method::POST, path, visibility, expr, routing::post(handler))
    }

    pub fn put<H, T>(self, path: &str, visibility: Visibility, expr: RoleExpr, handler: H) -> Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        self.route(Method::PUT, path, visibility, expr, routing::put(handler))
    }

    pub fn patch<H, T>(self, path: &str, visibility: Visibility, expr: RoleExpr, handler: H) -> Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        self.route(Method::PATCH, path, visibility, expr, routing::patch(handler))
    }

    pub fn delete<H, T>(self, path: &str, visibility: Visibility, expr: RoleExpr, handler: H) -> Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        self.route(Method::DELETE, path, visibility, expr, routing::delete(handler))
    }

    /// Mount `handler` for every method in [`ANY_METHODS`].
    pub fn any<H, T>(mut self, path: &str, visibility: Visibility, expr: RoleExpr, handler: H) -> Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        let keys = self.declarer.declare_any(path, visibility, expr);
        if let Some(key) = keys.first() {
            let path = key.path.clone();
            let guarded = self.guarded(routing::any(handler), visibility);
            self.router = self.router.route(&path, guarded);
        }
        self
    }

    /// The declarer used by this builder.
    pub fn declarer(&self) -> &RouteDeclarer {
        &self.declarer
    }

    pub fn into_router(self) -> Router<S> {
        self.router
    }

    fn guarded(&self, method_router: MethodRouter<S, Infallible>, visibility: Visibility) -> MethodRouter<S, Infallible> {
        if visibility.is_private() {
            method_router.route_layer(self.guard.clone())
        } else {
            method_router
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::models::Role;

    fn roles() -> RoleSnapshot {
        RoleSnapshot::new(
            vec![Role::new(1, "admin"), Role::new(2, "editor"), Role::new(3, "viewer")],
            "admin",
        )
    }

    #[test]
    fn test_allow_resolves_to_protected_grants() {
        let access = RoleExpr::allow([2, 3]).resolve(&roles());
        assert_eq!(access.policy, AccessPolicy::Protected);
        assert_eq!(access.roles.get(&RoleId(2)), Some(&true));
        assert_eq!(access.roles.get(&RoleId(3)), Some(&true));
        assert_eq!(access.roles.get(&RoleId(1)), None);
    }

    #[test]
    fn test_allow_named_skips_unknown_roles() {
        let access = RoleExpr::allow_named(["Editor", "ghost"]).resolve(&roles());
        assert_eq!(access.roles.len(), 1);
        assert_eq!(access.roles.get(&RoleId(2)), Some(&true));
    }

    #[test]
    fn test_allow_all_snapshots_known_roles() {
        let access = RoleExpr::AllowAll.resolve(&roles());
        assert_eq!(access.policy, AccessPolicy::AllowAll);
        assert_eq!(access.roles.len(), 3);
        assert!(access.roles.values().all(|v| *v));
    }

    #[test]
    fn test_forbid_denies_listed_and_allows_others() {
        let access = RoleExpr::forbid([3]).resolve(&roles());
        assert_eq!(access.policy, AccessPolicy::Protected);
        assert_eq!(access.roles.get(&RoleId(2)), Some(&true));
        assert_eq!(access.roles.get(&RoleId(3)), Some(&false));
    }

    #[test]
    fn test_forbid_unknown_role_is_still_denied() {
        let access = RoleExpr::forbid([9]).resolve(&roles());
        assert_eq!(access.roles.get(&RoleId(9)), Some(&false));
    }

    #[test]
    fn test_forbid_all() {
        let access = RoleExpr::ForbidAll.resolve(&roles());
        assert_eq!(access.policy, AccessPolicy::ForbidAll);
        assert!(access.roles.values().all(|v| !*v));
    }

    #[test]
    fn test_protected_has_no_grants() {
        let access = RoleExpr::protected().resolve(&roles());
        assert_eq!(access.policy, AccessPolicy::Protected);
        assert!(access.roles.is_empty());
    }

    #[test]
    fn test_declarer_qualifies_and_registers() {
        let registry = RuleRegistry::new();
        let store = RoleStore::new("admin");
        store.replace(roles().roles().cloned().collect());
        let declarer = RouteDeclarer::new(registry.clone(), store, "/api");

        let key = declarer.declare(&Method::GET, "//rules", Visibility::Private, RoleExpr::allow([2]));
        assert_eq!(key, RouteKey::new("GET", "/api/rules"));
        assert!(registry.is_fresh(&key));

        let keys = declarer.declare_any("/api/echo", Visibility::Public, RoleExpr::AllowAll);
        assert_eq!(keys.len(), ANY_METHODS.len());
        assert_eq!(registry.snapshot().public_count(), ANY_METHODS.len());
    }

    #[tokio::test]
    async fn test_router_mounts_public_and_guarded_routes() {
        use crate::config::RbacConfig;
        use crate::rbac::{MemoryStore, Rbac};
        use axum::{body::Body, http::{Request, StatusCode}};
        use std::sync::Arc;
        use tower::ServiceExt;

        let rbac = Rbac::new(RbacConfig::default(), Arc::new(MemoryStore::with_roles(["admin"]))).unwrap();
        rbac.init().await.unwrap();
        let app = rbac
            .router::<()>()
            .get("/open", Visibility::Public, RoleExpr::AllowAll, || async { "open" })
            .any("/echo", Visibility::Private, RoleExpr::protected(), || async { "echo" })
            .into_router();

        let status = |method: &str, uri: &str| {
            let app = app.clone();
            let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
            async move { app.oneshot(request).await.unwrap().status() }
        };
        assert_eq!(status("GET", "/api/open").await, StatusCode::OK);
        assert_eq!(status("GET", "/api/echo").await, StatusCode::UNAUTHORIZED);
        assert_eq!(status("POST", "/api/echo").await, StatusCode::UNAUTHORIZED);
        assert!(rbac.registry().is_fresh(&RouteKey::new("PATCH", "/api/echo")));
    }
}

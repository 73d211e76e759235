//! Administrative REST API.
//!
//! Every route under the service root is declared through
//! [`RbacRouter`](crate::rbac::RbacRouter), so the API is guarded by the
//! same rules it administers. Apart from `GET /api/health` (public) and
//! `GET /api/rbac/me` (any authenticated caller) the routes are protected:
//! only the highest-privilege role or roles granted an override get in.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/api/health` | liveness and database reachability |
//! | GET | `/api/rbac/me` | the caller's resolved roles |
//! | GET, POST | `/api/rbac/roles` | list / create roles |
//! | GET | `/api/rbac/rules` | persisted rules of this service |
//! | PUT | `/api/rbac/rules/:rule_id/policy` | set a rule's access policy |
//! | GET | `/api/rbac/rules/:rule_id/permissions` | a rule's overrides |
//! | PUT, DELETE | `/api/rbac/rules/:rule_id/permissions/:role_id` | set / clear an override |
//! | GET | `/api/rbac/users/:user_id/roles` | a user's roles |
//! | PUT, DELETE | `/api/rbac/users/:user_id/roles/:role_id` | assign / revoke |
//! | GET | `/api/rbac/routes` | the committed registry |
//! | POST | `/api/rbac/reload` | reload roles and rules |
//! | POST | `/api/rbac/sync` | reconcile, assign defaults, reload |
//! | GET | `/api/rbac/stats` | counters |
//! | GET | `/api/rbac/consistency` | storage consistency report |
//! | GET | `/api/rbac/explain` | explain a decision |

mod handlers;

use axum::{routing::get, Router};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::db::Database;
use crate::middleware::auth::AuthLayer;
use crate::rbac::{Rbac, RbacRouter, RoleExpr, Visibility};
use crate::telemetry::MetricsRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub rbac: Rbac,
    pub metrics: MetricsRegistry,
    /// Absent when running against an in-memory store.
    pub db: Option<Database>,
}

impl AppState {
    pub fn new(rbac: Rbac, metrics: MetricsRegistry, db: Option<Database>) -> Self {
        Self { rbac, metrics, db }
    }
}

/// Declare and mount the administrative routes.
///
/// Declaring is a side effect on the RBAC registry, so the admin CLI calls
/// this too (and discards the router) to learn the fresh route set before
/// reconciling.
pub fn declare_routes(rbac: &Rbac) -> RbacRouter<AppState> {
    use Visibility::{Private, Public};

    rbac.router()
        .get("/health", Public, RoleExpr::AllowAll, handlers::health_check)
        .get("/rbac/me", Private, RoleExpr::AllowAll, handlers::whoami)
        .get("/rbac/roles", Private, RoleExpr::protected(), handlers::list_roles)
        .post("/rbac/roles", Private, RoleExpr::protected(), handlers::create_role)
        .get("/rbac/rules", Private, RoleExpr::protected(), handlers::list_rules)
        .put(
            "/rbac/rules/:rule_id/policy",
            Private,
            RoleExpr::protected(),
            handlers::set_policy,
        )
        .get(
            "/rbac/rules/:rule_id/permissions",
            Private,
            RoleExpr::protected(),
            handlers::rule_permissions,
        )
        .put(
            "/rbac/rules/:rule_id/permissions/:role_id",
            Private,
            RoleExpr::protected(),
            handlers::set_override,
        )
        .delete(
            "/rbac/rules/:rule_id/permissions/:role_id",
            Private,
            RoleExpr::protected(),
            handlers::clear_override,
        )
        .get(
            "/rbac/users/:user_id/roles",
            Private,
            RoleExpr::protected(),
            handlers::user_roles,
        )
        .put(
            "/rbac/users/:user_id/roles/:role_id",
            Private,
            RoleExpr::protected(),
            handlers::assign_role,
        )
        .delete(
            "/rbac/users/:user_id/roles/:role_id",
            Private,
            RoleExpr::protected(),
            handlers::revoke_role,
        )
        .get("/rbac/routes", Private, RoleExpr::protected(), handlers::list_routes)
        .post("/rbac/reload", Private, RoleExpr::protected(), handlers::reload)
        .post("/rbac/sync", Private, RoleExpr::protected(), handlers::sync)
        .get("/rbac/stats", Private, RoleExpr::protected(), handlers::stats)
        .get(
            "/rbac/consistency",
            Private,
            RoleExpr::protected(),
            handlers::consistency,
        )
        .get("/rbac/explain", Private, RoleExpr::protected(), handlers::explain)
}

/// Build the HTTP application: declared API routes, `/metrics`, identity
/// extraction, tracing and CORS.
pub fn build_router(state: AppState, auth: AuthLayer) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    declare_routes(&state.rbac)
        .into_router()
        .route("/metrics", get(handlers::prometheus_metrics))
        .layer(auth)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::{MemoryStore, RouteKey};
    use crate::config::RbacConfig;
    use std::sync::Arc;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, Some("test data"));
    }

    #[tokio::test]
    async fn test_declare_routes_registers_admin_surface() {
        let store = Arc::new(MemoryStore::with_roles(["admin"]));
        let rbac = Rbac::new(RbacConfig::default(), store).unwrap();
        rbac.init().await.unwrap();

        let _router = declare_routes(&rbac).into_router();

        let registry = rbac.registry();
        assert!(registry.is_fresh(&RouteKey::new("GET", "/api/health")));
        assert!(registry.is_fresh(&RouteKey::new("PUT", "/api/rbac/rules/:rule_id/permissions/:role_id")));
        assert!(registry.is_fresh(&RouteKey::new("DELETE", "/api/rbac/users/:user_id/roles/:role_id")));
        assert_eq!(registry.fresh_count(), 18);

        let public: Vec<_> = registry
            .fresh_routes()
            .into_iter()
            .filter(|r| !r.is_private)
            .map(|r| r.key)
            .collect();
        assert_eq!(public, vec![RouteKey::new("GET", "/api/health")]);
    }
}

//! HTTP-level tests of the administrative router: bearer-token identity,
//! the permission guard and the JSON bodies it answers with.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use lingua_core::api::{build_router, AppState};
use lingua_core::config::RbacConfig;
use lingua_core::middleware::auth::{AuthConfig, AuthLayer, Authenticator, Claims};
use lingua_core::rbac::{MemoryStore, Rbac, RoleId, RouteKey, RuleId, UserId};
use lingua_core::telemetry::MetricsRegistry;

const SECRET: &str = "test-secret-key-for-http-guard";
const ADMIN: RoleId = RoleId(1);
const EDITOR: RoleId = RoleId(2);

struct TestApp {
    router: Router,
    rbac: Rbac,
    store: Arc<MemoryStore>,
    authenticator: Arc<Authenticator>,
}

impl TestApp {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::with_roles(["admin", "editor"]));
        let rbac = Rbac::new(RbacConfig::default(), store.clone()).unwrap();
        rbac.init().await.unwrap();

        let authenticator = Arc::new(
            Authenticator::new(AuthConfig::builder().jwt_secret(SECRET).build()).unwrap(),
        );
        let state = AppState::new(rbac.clone(), MetricsRegistry::disabled(), None);
        let router = build_router(state, AuthLayer::new(authenticator.clone()));

        Self {
            router,
            rbac,
            store,
            authenticator,
        }
    }

    fn token(&self, user: &str) -> String {
        self.authenticator
            .generate_token(&Claims::builder(user).build())
            .unwrap()
    }

    async fn send(&self, method: &str, uri: &str, user: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.token(user)));
        }
        let request = builder.body(Body::empty()).unwrap();
        self.call(request).await
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn rule_id(&self, method: &str, path: &str) -> RuleId {
        let key = RouteKey::new(method, path);
        self.rbac
            .routes()
            .into_iter()
            .find(|r| r.key == key)
            .and_then(|r| r.rule_id)
            .unwrap()
    }
}

#[tokio::test]
async fn test_health_is_public() {
    let app = TestApp::new().await;
    let (status, body) = app.send("GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"]["status"], "not_configured");
}

#[tokio::test]
async fn test_anonymous_private_request_is_unauthenticated() {
    let app = TestApp::new().await;
    let (status, body) = app.send("GET", "/api/rbac/me", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
    assert_eq!(body["error"]["reason"], "unauthenticated");
}

#[tokio::test]
async fn test_invalid_token_only_blocks_private_routes() {
    let app = TestApp::new().await;
    let garbage = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = app.call(garbage("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = app.call(garbage("/api/rbac/me")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn test_whoami_lists_resolved_roles() {
    let app = TestApp::new().await;
    app.rbac.assign_role(&UserId::new("alice"), EDITOR).await.unwrap();

    let (status, body) = app.send("GET", "/api/rbac/me", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user_id"], "alice");
    assert_eq!(body["data"]["roles"][0]["name"], "editor");
}

#[tokio::test]
async fn test_protected_route_needs_override() {
    let app = TestApp::new().await;
    app.rbac.synchronize().await.unwrap();
    app.rbac.assign_role(&UserId::new("alice"), EDITOR).await.unwrap();

    let (status, body) = app.send("GET", "/api/rbac/roles", Some("alice")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");
    assert_eq!(body["error"]["reason"], "implicit_deny");

    let rule = app.rule_id("GET", "/api/rbac/roles");
    app.rbac.set_override(rule, EDITOR, Some(true)).await.unwrap();

    let (status, body) = app.send("GET", "/api/rbac/roles", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_admin_reaches_every_route() {
    let app = TestApp::new().await;
    app.rbac.bootstrap_admin(&UserId::new("root")).await.unwrap();

    let (status, body) = app.send("GET", "/api/rbac/stats", Some("root")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["rbac"]["highest_role"], "admin");

    let (status, body) = app.send("POST", "/api/rbac/reload", Some("root")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["roles"], 2);
}

#[tokio::test]
async fn test_admin_manages_overrides_over_http() {
    let app = TestApp::new().await;
    app.rbac.synchronize().await.unwrap();
    app.rbac.bootstrap_admin(&UserId::new("root")).await.unwrap();
    app.rbac.assign_role(&UserId::new("bob"), EDITOR).await.unwrap();
    let rule = app.rule_id("GET", "/api/rbac/routes");

    let (status, _) = app.send("GET", "/api/rbac/routes", Some("bob")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let uri = format!("/api/rbac/rules/{}/permissions/{}", rule, EDITOR);
    let request = Request::builder()
        .method("PUT")
        .uri(&uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", app.token("root")))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"allowed": true}"#))
        .unwrap();
    let (status, _) = app.call(request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.send("GET", "/api/rbac/routes", Some("bob")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.send("DELETE", &uri, Some("root")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.send("GET", "/api/rbac/routes", Some("bob")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_storage_outage_is_a_generic_server_error() {
    let app = TestApp::new().await;
    app.rbac.assign_role(&UserId::new("alice"), EDITOR).await.unwrap();
    app.store.set_unavailable(true);

    let (status, body) = app.send("GET", "/api/rbac/me", Some("alice")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    let message = body["error"]["message"].as_str().unwrap_or_default();
    assert!(!message.contains("memory store"));
}

#[tokio::test]
async fn test_unknown_rule_is_not_found() {
    let app = TestApp::new().await;
    app.rbac.assign_role(&UserId::new("root"), ADMIN).await.unwrap();

    let (status, body) = app.send("GET", "/api/rbac/rules/999/permissions", Some("root")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "RULE_NOT_FOUND");
}

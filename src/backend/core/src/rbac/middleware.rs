//! Permission guard for private routes.
//!
//! [`PermissionLayer`] is attached as a route layer by the declaration API.
//! It reads the route template axum matched, the caller's [`AuthContext`]
//! (inserted by the authentication layer) and asks the
//! [`PermissionEvaluator`] for a decision. Allowed requests carry an
//! [`RbacContext`] to the handler; denied requests are answered here.

use axum::{
    body::Body,
    extract::{FromRequestParts, MatchedPath, Request},
    http::{header::ACCEPT_LANGUAGE, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeSet;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use super::identity::IdentityResolver;
use super::models::{RoleId, RouteKey, UserId};
use super::policy::{AllowReason, Caller, Decision, DenyReason, Locale, PermissionEvaluator};
use crate::error::LinguaError;
use crate::middleware::auth::AuthContext;

// ═══════════════════════════════════════════════════════════════════════════════
// RBAC Context (extracted in handlers)
// ═══════════════════════════════════════════════════════════════════════════════

/// What the guard decided, available to handlers of private routes.
#[derive(Debug, Clone, Serialize)]
pub struct RbacContext {
    pub user_id: Option<UserId>,
    pub roles: BTreeSet<RoleId>,
    pub route: RouteKey,
    pub reason: AllowReason,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RbacContext
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RbacContext>()
            .cloned()
            .ok_or_else(|| {
                let body = serde_json::json!({
                    "success": false,
                    "error": {
                        "code": "MISSING_RBAC_CONTEXT",
                        "message": "Authorization context not available. Is the route declared private?",
                    }
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that puts the permission guard in front of a route.
#[derive(Clone, Debug)]
pub struct PermissionLayer {
    evaluator: PermissionEvaluator,
    identity: IdentityResolver,
}

impl PermissionLayer {
    pub fn new(evaluator: PermissionEvaluator, identity: IdentityResolver) -> Self {
        Self { evaluator, identity }
    }
}

impl<S> Layer<S> for PermissionLayer {
    type Service = PermissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PermissionService {
            inner,
            evaluator: self.evaluator.clone(),
            identity: self.identity.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Service that evaluates the caller's permission per request.
#[derive(Clone)]
pub struct PermissionService<S> {
    inner: S,
    evaluator: PermissionEvaluator,
    identity: IdentityResolver,
}

impl<S> Service<Request<Body>> for PermissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let evaluator = self.evaluator.clone();
        let identity = self.identity.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let method = request.method().as_str().to_owned();
            let path = request
                .extensions()
                .get::<MatchedPath>()
                .map(|p| p.as_str().to_owned())
                .unwrap_or_else(|| request.uri().path().to_owned());
            let locale = request_locale(request.headers());

            let caller = match request.extensions().get::<AuthContext>() {
                Some(auth) => identity.resolve_auth(auth).await,
                None => Ok(Caller::anonymous()),
            };
            let caller = match caller {
                Ok(caller) => caller,
                Err(e) => return Ok(LinguaError::from(e).into_response()),
            };

            match evaluator.evaluate(&method, &path, &caller).await {
                Ok(Decision::Allow(reason)) => {
                    request.extensions_mut().insert(RbacContext {
                        user_id: caller.user_id,
                        roles: caller.roles,
                        route: RouteKey::new(&method, &path),
                        reason,
                    });
                    inner.call(request).await
                }
                Ok(Decision::Deny(reason)) => Ok(deny_response(reason, locale)),
                Err(e) => Ok(LinguaError::from(e).into_response()),
            }
        })
    }
}

/// Locale requested by the client.
pub fn request_locale(headers: &HeaderMap) -> Locale {
    headers
        .get(ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .map(Locale::from_accept_language)
        .unwrap_or_default()
}

/// 401 for an unauthenticated caller, 403 for every other denial.
pub fn deny_response(reason: DenyReason, locale: Locale) -> Response {
    let body = serde_json::json!({
        "success": false,
        "error": {
            "code": reason.external_code(),
            "reason": reason.code(),
            "message": reason.message(locale),
        }
    });
    (reason.status(), Json(body)).into_response()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_deny_response_status() {
        let resp = deny_response(DenyReason::Unauthenticated, Locale::En);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = deny_response(DenyReason::RuleNotFound, Locale::Vi);
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_request_locale() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_locale(&headers), Locale::En);
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("vi"));
        assert_eq!(request_locale(&headers), Locale::Vi);
    }
}

//! Bearer-token identity extraction.
//!
//! Tokens are issued by another service; this layer only validates them and
//! records who the caller is. A missing or rejected token leaves the request
//! anonymous, so only guarded routes refuse it. Role membership is never read from the token:
//! the RBAC guard resolves it from storage on every request.
//!
//! # Example
//!
//! ```rust,ignore
//! use lingua_core::middleware::auth::{AuthConfig, AuthLayer};
//!
//! let config = AuthConfig::builder()
//!     .jwt_secret("your-secret-key")
//!     .build();
//!
//! let app = Router::new()
//!     .route("/api/rules", get(list_rules))
//!     .layer(AuthLayer::from_config(config)?);
//! ```

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tower::{Layer, Service};
use tracing::debug;
use uuid::Uuid;

use crate::config::AuthSettings;

const REQUEST_ID_HEADER: &str = "X-Request-ID";

// ═══════════════════════════════════════════════════════════════════════════════
// Error Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token validation error: {0}")]
    ValidationError(String),

    #[error("Internal authentication error: {0}")]
    Internal(String),
}

impl AuthError {
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Self::MissingCredentials => (
                StatusCode::UNAUTHORIZED,
                "MISSING_CREDENTIALS",
                "Authentication credentials are required",
            ),
            Self::InvalidToken | Self::ValidationError(_) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "The provided token is invalid",
            ),
            Self::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                "TOKEN_EXPIRED",
                "The authentication token has expired",
            ),
            Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An authentication error occurred",
            ),
        }
    }

    /// Stable machine-readable code, also the `error_type` metric label.
    pub fn code(&self) -> &'static str {
        self.parts().1
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        counter!("auth_errors_total", "error_type" => code).increment(1);

        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": code,
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JWT Claims
// ═══════════════════════════════════════════════════════════════════════════════

/// JWT token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Token ID
    #[serde(default = "generate_jti")]
    pub jti: String,

    pub iat: i64,

    pub exp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

fn generate_jti() -> String {
    Uuid::new_v4().to_string()
}

impl Claims {
    pub fn builder(user_id: impl Into<String>) -> ClaimsBuilder {
        ClaimsBuilder::new(user_id)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Builder for JWT claims.
pub struct ClaimsBuilder {
    claims: Claims,
}

impl ClaimsBuilder {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            claims: Claims {
                sub: user_id.into(),
                email: None,
                name: None,
                jti: generate_jti(),
                iat: now.timestamp(),
                exp: (now + Duration::hours(1)).timestamp(),
                nbf: None,
                iss: None,
                aud: None,
            },
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.claims.email = Some(email.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.claims.name = Some(name.into());
        self
    }

    pub fn expires_in(mut self, duration: Duration) -> Self {
        self.claims.exp = (Utc::now() + duration).timestamp();
        self
    }

    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.claims.iss = Some(issuer.into());
        self
    }

    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.claims.aud = Some(audience.into());
        self
    }

    pub fn build(self) -> Claims {
        self.claims
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// When false every request is anonymous
    pub enabled: bool,

    /// HMAC secret (HS256/HS384/HS512)
    pub jwt_secret: Option<String>,

    pub jwt_algorithm: Algorithm,

    pub issuer: Option<String>,

    pub audience: Option<String>,

    /// Leeway for expiration checks (in seconds)
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jwt_secret: None,
            jwt_algorithm: Algorithm::HS256,
            issuer: None,
            audience: None,
            leeway_secs: 60,
        }
    }
}

impl AuthConfig {
    pub fn builder() -> AuthConfigBuilder {
        AuthConfigBuilder::default()
    }
}

impl From<&AuthSettings> for AuthConfig {
    fn from(settings: &AuthSettings) -> Self {
        Self {
            enabled: settings.enabled,
            jwt_secret: settings.jwt_secret.clone(),
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
            leeway_secs: settings.leeway_secs,
            ..Default::default()
        }
    }
}

/// Builder for auth configuration.
#[derive(Default)]
pub struct AuthConfigBuilder {
    config: AuthConfig,
}

impl AuthConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt_secret = Some(secret.into());
        self
    }

    pub fn jwt_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.config.jwt_algorithm = algorithm;
        self
    }

    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.config.issuer = Some(issuer.into());
        self
    }

    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.config.audience = Some(audience.into());
        self
    }

    pub fn leeway_secs(mut self, secs: u64) -> Self {
        self.config.leeway_secs = secs;
        self
    }

    pub fn build(self) -> AuthConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authentication Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Who is calling, attached to every request by [`AuthLayer`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Token subject, or `"anonymous"`
    pub user_id: String,

    pub email: Option<String>,

    pub name: Option<String>,

    pub auth_method: AuthMethod,

    pub token_id: Option<String>,

    pub expires_at: Option<DateTime<Utc>>,

    /// Request ID for correlation
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Jwt,
    Anonymous,
}

impl AuthContext {
    pub fn from_claims(claims: Claims, request_id: impl Into<String>) -> Self {
        let expires_at = claims.expires_at();
        Self {
            user_id: claims.sub,
            email: claims.email,
            name: claims.name,
            auth_method: AuthMethod::Jwt,
            token_id: Some(claims.jti),
            expires_at,
            request_id: request_id.into(),
        }
    }

    pub fn anonymous(request_id: impl Into<String>) -> Self {
        Self {
            user_id: "anonymous".to_string(),
            email: None,
            name: None,
            auth_method: AuthMethod::Anonymous,
            token_id: None,
            expires_at: None,
            request_id: request_id.into(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_method != AuthMethod::Anonymous
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authenticator
// ═══════════════════════════════════════════════════════════════════════════════

/// Validates bearer tokens.
pub struct Authenticator {
    config: AuthConfig,
    encoding_key: Option<EncodingKey>,
    decoding_key: Option<DecodingKey>,
    validation: Validation,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        let (encoding_key, decoding_key) = match config.jwt_algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => match config.jwt_secret {
                Some(ref secret) if !secret.is_empty() => (
                    Some(EncodingKey::from_secret(secret.as_bytes())),
                    Some(DecodingKey::from_secret(secret.as_bytes())),
                ),
                _ if !config.enabled => (None, None),
                _ => {
                    return Err(AuthError::Internal(
                        "JWT secret required for HMAC algorithms".into(),
                    ))
                }
            },
            other => {
                return Err(AuthError::Internal(format!(
                    "Unsupported JWT algorithm: {:?}",
                    other
                )));
            }
        };

        let mut validation = Validation::new(config.jwt_algorithm);
        validation.leeway = config.leeway_secs;
        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Ok(Self {
            config,
            encoding_key,
            decoding_key,
            validation,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Identify the caller. `Ok(None)` when no bearer token is present.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Option<AuthContext>, AuthError> {
        let Some(token) = extract_bearer(headers) else {
            return Ok(None);
        };
        self.validate_jwt(token, request_id(headers)).map(Some)
    }

    fn validate_jwt(&self, token: &str, request_id: String) -> Result<AuthContext, AuthError> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("JWT decoding key not configured".into()))?;

        let token_data = decode::<Claims>(token, decoding_key, &self.validation).map_err(|e| {
            debug!("JWT validation failed: {}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidToken,
                _ => AuthError::ValidationError(e.to_string()),
            }
        })?;

        counter!("auth_success_total", "method" => "jwt").increment(1);
        Ok(AuthContext::from_claims(token_data.claims, request_id))
    }

    /// Sign claims with the configured secret. Used by tooling and tests.
    pub fn generate_token(&self, claims: &Claims) -> Result<String, AuthError> {
        let encoding_key = self
            .encoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("JWT encoding key not configured".into()))?;

        encode(&Header::new(self.config.jwt_algorithm), claims, encoding_key)
            .map_err(|e| AuthError::Internal(format!("Failed to generate token: {}", e)))
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or_else(|| s.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication layer for Tower.
#[derive(Clone)]
pub struct AuthLayer {
    authenticator: Arc<Authenticator>,
}

impl AuthLayer {
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self { authenticator }
    }

    pub fn from_config(config: AuthConfig) -> Result<Self, AuthError> {
        Ok(Self::new(Arc::new(Authenticator::new(config)?)))
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            authenticator: self.authenticator.clone(),
        }
    }
}

/// Authentication service.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    authenticator: Arc<Authenticator>,
}

impl<S> Service<Request<Body>> for AuthService<S>
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
        let authenticator = self.authenticator.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let context = if authenticator.is_enabled() {
                match authenticator.authenticate(request.headers()) {
                    Ok(Some(context)) => context,
                    Ok(None) => AuthContext::anonymous(request_id(request.headers())),
                    Err(e) => {
                        // Public routes still serve; the RBAC guard answers 401 on private ones.
                        counter!("auth_errors_total", "error_type" => e.code()).increment(1);
                        debug!(error = %e, "Bearer token rejected, continuing as anonymous");
                        AuthContext::anonymous(request_id(request.headers()))
                    }
                }
            } else {
                AuthContext::anonymous(request_id(request.headers()))
            };

            request.extensions_mut().insert(context);
            inner.call(request).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Extractor
// ═══════════════════════════════════════════════════════════════════════════════

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AuthError::MissingCredentials)
    }
}

/// Guard that requires an authenticated caller.
pub struct RequireAuth(pub AuthContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AuthError::MissingCredentials)?;

        if !ctx.is_authenticated() {
            return Err(AuthError::MissingCredentials);
        }

        Ok(RequireAuth(ctx))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use axum::http::HeaderValue;
    use tower::ServiceExt;

    const SECRET: &str = "super-secret-key-for-testing-only";

    fn authenticator() -> Authenticator {
        Authenticator::new(AuthConfig::builder().jwt_secret(SECRET).build()).unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_claims_builder() {
        let claims = Claims::builder("user123")
            .email("test@example.com")
            .expires_in(Duration::hours(24))
            .build();

        assert_eq!(claims.sub, "user123");
        assert_eq!(claims.email, Some("test@example.com".to_string()));
        assert!(!claims.is_expired());
    }

    #[test]
    fn test_token_round_trip_identifies_user() {
        let auth = authenticator();
        let token = auth.generate_token(&Claims::builder("u2").build()).unwrap();

        let ctx = auth.authenticate(&bearer(&token)).unwrap().unwrap();
        assert_eq!(ctx.user_id, "u2");
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.auth_method, AuthMethod::Jwt);
    }

    #[test]
    fn test_missing_token_is_not_an_error() {
        assert!(authenticator().authenticate(&HeaderMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_expired_and_forged_tokens_are_rejected() {
        let auth = authenticator();
        let expired = Claims::builder("u1").expires_in(Duration::hours(-2)).build();
        let token = auth.generate_token(&expired).unwrap();
        assert!(matches!(auth.authenticate(&bearer(&token)), Err(AuthError::TokenExpired)));

        let other = Authenticator::new(AuthConfig::builder().jwt_secret("another-secret").build()).unwrap();
        let forged = other.generate_token(&Claims::builder("u1").build()).unwrap();
        assert!(matches!(auth.authenticate(&bearer(&forged)), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_enabled_without_secret_is_rejected() {
        assert!(Authenticator::new(AuthConfig::default()).is_err());
        assert!(Authenticator::new(AuthConfig::builder().enabled(false).build()).is_ok());
    }

    #[test]
    fn test_from_settings() {
        let settings = AuthSettings {
            jwt_secret: Some("s".into()),
            issuer: Some("lingua".into()),
            ..Default::default()
        };
        let config = AuthConfig::from(&settings);
        assert!(config.enabled);
        assert_eq!(config.issuer.as_deref(), Some("lingua"));
        assert_eq!(config.leeway_secs, 60);
    }

    #[tokio::test]
    async fn test_layer_inserts_context() {
        let auth = Arc::new(authenticator());
        let token = auth.generate_token(&Claims::builder("u7").build()).unwrap();
        let app = Router::new()
            .route("/whoami", get(|ctx: AuthContext| async move { ctx.user_id }))
            .layer(AuthLayer::new(auth));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header(AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"u7");

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"anonymous");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header(AUTHORIZATION, "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"anonymous");
    }
}

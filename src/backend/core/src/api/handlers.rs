//! Administrative request handlers.
//!
//! All handlers return `Result<impl IntoResponse, LinguaError>`; `RbacError`
//! converts into `LinguaError` so storage details never reach the client.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use super::{ApiResponse, AppState};
use crate::error::LinguaError;
use crate::rbac::{AccessPolicy, AssignStrategy, RbacContext, RoleId, RuleId, UserId};

// ═══════════════════════════════════════════════════════════════════════════════
// Health and metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.db {
        Some(db) => match db.ping().await {
            Ok(latency) => serde_json::json!({
                "status": "up",
                "latency_ms": latency.as_millis() as u64,
            }),
            Err(_) => serde_json::json!({ "status": "down" }),
        },
        None => serde_json::json!({ "status": "not_configured" }),
    };
    let healthy = database["status"] != "down";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "service": state.rbac.config().service,
            "database": database,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Caller
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
pub struct WhoAmI {
    pub user_id: Option<UserId>,
    pub roles: Vec<RoleView>,
}

#[derive(Serialize)]
pub struct RoleView {
    pub id: RoleId,
    pub name: Option<String>,
}

pub async fn whoami(State(state): State<AppState>, ctx: RbacContext) -> impl IntoResponse {
    let roles = state.rbac.roles().snapshot();
    let response = WhoAmI {
        user_id: ctx.user_id,
        roles: ctx
            .roles
            .into_iter()
            .map(|id| RoleView {
                id,
                name: roles.name_of(id).map(str::to_string),
            })
            .collect(),
    };
    Json(ApiResponse::success(response))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Roles
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_roles(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.rbac.list_roles()))
}

#[derive(Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
}

pub async fn create_role(
    State(state): State<AppState>,
    ctx: RbacContext,
    Json(req): Json<CreateRoleRequest>,
) -> Result<impl IntoResponse, LinguaError> {
    if req.name.trim().is_empty() {
        return Err(LinguaError::validation("Role name cannot be empty"));
    }
    let (role, created) = state.rbac.create_role(&req.name).await?;
    info!(actor = ?ctx.user_id, role = %role.name, created, "Role create requested");

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(role))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rules and overrides
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_rules(State(state): State<AppState>) -> Result<impl IntoResponse, LinguaError> {
    let rules = state.rbac.list_rules().await?;
    Ok(Json(ApiResponse::success(rules)))
}

#[derive(Deserialize)]
pub struct PolicyRequest {
    pub policy: AccessPolicy,
}

pub async fn set_policy(
    State(state): State<AppState>,
    ctx: RbacContext,
    Path(rule_id): Path<i32>,
    Json(req): Json<PolicyRequest>,
) -> Result<impl IntoResponse, LinguaError> {
    state.rbac.set_policy(RuleId(rule_id), req.policy).await?;
    info!(actor = ?ctx.user_id, rule_id, policy = %req.policy, "Rule policy updated");
    Ok(Json(ApiResponse::success(serde_json::json!({
        "rule_id": rule_id,
        "policy": req.policy,
    }))))
}

pub async fn rule_permissions(
    State(state): State<AppState>,
    Path(rule_id): Path<i32>,
) -> Result<impl IntoResponse, LinguaError> {
    let permissions = state.rbac.rule_permissions(RuleId(rule_id)).await?;
    Ok(Json(ApiResponse::success(permissions)))
}

/// `allowed: null` (or absent) defers to the rule's policy.
#[derive(Deserialize)]
pub struct OverrideRequest {
    #[serde(default)]
    pub allowed: Option<bool>,
}

pub async fn set_override(
    State(state): State<AppState>,
    ctx: RbacContext,
    Path((rule_id, role_id)): Path<(i32, i32)>,
    Json(req): Json<OverrideRequest>,
) -> Result<impl IntoResponse, LinguaError> {
    state
        .rbac
        .set_override(RuleId(rule_id), RoleId(role_id), req.allowed)
        .await?;
    info!(actor = ?ctx.user_id, rule_id, role_id, allowed = ?req.allowed, "Override updated");
    Ok(Json(ApiResponse::success(serde_json::json!({
        "rule_id": rule_id,
        "role_id": role_id,
        "allowed": req.allowed,
    }))))
}

pub async fn clear_override(
    State(state): State<AppState>,
    ctx: RbacContext,
    Path((rule_id, role_id)): Path<(i32, i32)>,
) -> Result<impl IntoResponse, LinguaError> {
    state.rbac.clear_override(RuleId(rule_id), RoleId(role_id)).await?;
    info!(actor = ?ctx.user_id, rule_id, role_id, "Override removed");
    Ok(StatusCode::NO_CONTENT)
}

// ═══════════════════════════════════════════════════════════════════════════════
// User roles
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn user_roles(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, LinguaError> {
    let roles = state.rbac.user_roles(&UserId::new(user_id)).await?;
    Ok(Json(ApiResponse::success(roles)))
}

pub async fn assign_role(
    State(state): State<AppState>,
    ctx: RbacContext,
    Path((user_id, role_id)): Path<(String, i32)>,
) -> Result<impl IntoResponse, LinguaError> {
    let user = UserId::new(user_id);
    let assigned = state.rbac.assign_role(&user, RoleId(role_id)).await?;
    info!(actor = ?ctx.user_id, user_id = %user, role_id, assigned, "Role assignment requested");
    Ok(Json(ApiResponse::success(serde_json::json!({
        "user_id": user,
        "role_id": role_id,
        "assigned": assigned,
    }))))
}

pub async fn revoke_role(
    State(state): State<AppState>,
    ctx: RbacContext,
    Path((user_id, role_id)): Path<(String, i32)>,
) -> Result<impl IntoResponse, LinguaError> {
    let user = UserId::new(user_id);
    let revoked = state.rbac.revoke_role(&user, RoleId(role_id)).await?;
    info!(actor = ?ctx.user_id, user_id = %user, role_id, revoked, "Role revocation requested");
    Ok(Json(ApiResponse::success(serde_json::json!({
        "user_id": user,
        "role_id": role_id,
        "revoked": revoked,
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry administration
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_routes(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.rbac.routes()))
}

pub async fn reload(State(state): State<AppState>) -> Result<impl IntoResponse, LinguaError> {
    let report = state.rbac.reload().await?;
    Ok(Json(ApiResponse::success(report)))
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub defaults: AssignStrategy,
    /// Overrides the configured sync timeout
    pub timeout_secs: Option<u64>,
}

pub async fn sync(
    State(state): State<AppState>,
    ctx: RbacContext,
    Json(req): Json<SyncRequest>,
) -> Result<impl IntoResponse, LinguaError> {
    if req.timeout_secs == Some(0) {
        return Err(LinguaError::validation("timeout_secs must be positive"));
    }
    info!(actor = ?ctx.user_id, strategy = ?req.defaults, "Full sync requested");
    let report = state
        .rbac
        .full_sync(&req.defaults, req.timeout_secs.map(Duration::from_secs))
        .await?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.db.as_ref().map(|db| db.pool_stats());
    Json(ApiResponse::success(serde_json::json!({
        "rbac": state.rbac.stats(),
        "pool": pool,
    })))
}

pub async fn consistency(State(state): State<AppState>) -> Result<impl IntoResponse, LinguaError> {
    let report = state.rbac.consistency_report().await?;
    Ok(Json(ApiResponse::success(report)))
}

#[derive(Deserialize)]
pub struct ExplainQuery {
    /// Anonymous when absent
    pub user_id: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
}

fn default_method() -> String {
    "GET".to_string()
}

pub async fn explain(
    State(state): State<AppState>,
    Query(query): Query<ExplainQuery>,
) -> Result<impl IntoResponse, LinguaError> {
    if query.path.trim().is_empty() {
        return Err(LinguaError::validation("path cannot be empty"));
    }
    let user = query.user_id.filter(|u| !u.trim().is_empty()).map(UserId::new);
    let explanation = state
        .rbac
        .explain(user.as_ref(), &query.method, &query.path)
        .await?;
    Ok(Json(ApiResponse::success(explanation)))
}

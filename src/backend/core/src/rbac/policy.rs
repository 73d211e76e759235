//! Request-time permission evaluation.
//!
//! The evaluator answers one question: may this caller invoke this
//! (method, template path)? Checks run in a fixed order:
//!
//! 1. A caller holding the highest-privilege role is allowed outright.
//! 2. The route is looked up in the committed registry. A miss is either
//!    allowed (`unassigned_routes_are_public`) or resolved against storage;
//!    no persisted rule means deny.
//! 3. Public routes are allowed whatever their policy.
//! 4. A private route needs a caller identity. A caller with no roles is
//!    treated as unauthenticated unless the route allows everyone.
//! 5. `AllowAll` and `ForbidAll` decide before any per-role override.
//! 6. For `Protected` routes the caller's roles are checked in ascending id
//!    order. An explicit deny on any held role wins over an explicit grant on
//!    another; no override at all is an implicit deny.
//!
//! Steps 3 to 6 live in [`decide`], which is shared by the registry path and
//! the storage fallback path.

use axum::http::StatusCode;
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use super::error::RbacResult;
use super::models::{AccessPolicy, RoleId, RouteKey, RouteSnapshot, UserId};
use super::registry::{RegistrySnapshot, RuleRegistry};
use super::roles::RoleStore;
use super::store::RbacStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a request was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    HighestPrivilege,
    PublicRoute,
    UnassignedPublic,
    AllowAll,
    ExplicitGrant,
}

impl AllowReason {
    pub const fn code(self) -> &'static str {
        match self {
            Self::HighestPrivilege => "highest_privilege",
            Self::PublicRoute => "public_route",
            Self::UnassignedPublic => "unassigned_public",
            Self::AllowAll => "allow_all",
            Self::ExplicitGrant => "explicit_grant",
        }
    }
}

/// Why a request was denied.
///
/// The reasons are distinguished in logs and in the `reason` field of the
/// response; externally every reason except `Unauthenticated` is a 403.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Unauthenticated,
    ExplicitDeny,
    ImplicitDeny,
    ForbiddenForAll,
    RuleNotFound,
}

impl DenyReason {
    /// Stable machine-readable reason.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::ExplicitDeny => "explicit_deny",
            Self::ImplicitDeny => "implicit_deny",
            Self::ForbiddenForAll => "forbidden_for_all",
            Self::RuleNotFound => "rule_not_found",
        }
    }

    /// Error code shown to clients.
    pub const fn external_code(self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            _ => "FORBIDDEN",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            _ => StatusCode::FORBIDDEN,
        }
    }

    /// Human-readable message in the given locale.
    pub const fn message(self, locale: Locale) -> &'static str {
        match (self, locale) {
            (Self::Unauthenticated, Locale::En) => "Authentication is required to access this resource.",
            (Self::Unauthenticated, Locale::Vi) => "Bạn cần đăng nhập để truy cập tài nguyên này.",
            (_, Locale::En) => "You do not have permission to access this resource.",
            (_, Locale::Vi) => "Bạn không có quyền truy cập tài nguyên này.",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow(AllowReason),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Deny(_))
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::Deny(reason) => Some(*reason),
            Self::Allow(_) => None,
        }
    }

    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Allow(_) => "allow",
            Self::Deny(_) => "deny",
        }
    }

    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::Allow(reason) => reason.code(),
            Self::Deny(reason) => reason.code(),
        }
    }
}

/// Message language for denial responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Vi,
}

impl Locale {
    /// Pick a locale from an `Accept-Language` header value. The first
    /// supported language tag wins; anything else is English.
    pub fn from_accept_language(header: &str) -> Self {
        for tag in header.split(',') {
            let lang = tag
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            let primary = lang.split('-').next().unwrap_or_default();
            match primary {
                "vi" => return Self::Vi,
                "en" => return Self::En,
                _ => continue,
            }
        }
        Self::En
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Caller
// ═══════════════════════════════════════════════════════════════════════════════

/// Who is making the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Caller {
    pub user_id: Option<UserId>,
    pub roles: BTreeSet<RoleId>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(user_id: impl Into<UserId>, roles: impl IntoIterator<Item = RoleId>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            roles: roles.into_iter().collect(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decision function
// ═══════════════════════════════════════════════════════════════════════════════

/// Decide for a route that has been found, after the highest-privilege
/// bypass has been ruled out.
pub fn decide(route: &RouteSnapshot, caller: &Caller) -> Decision {
    if !route.is_private {
        return Decision::Allow(AllowReason::PublicRoute);
    }
    if !caller.is_authenticated() {
        return Decision::Deny(DenyReason::Unauthenticated);
    }
    if caller.roles.is_empty() && route.access_policy != AccessPolicy::AllowAll {
        return Decision::Deny(DenyReason::Unauthenticated);
    }

    match route.access_policy {
        AccessPolicy::AllowAll => Decision::Allow(AllowReason::AllowAll),
        AccessPolicy::ForbidAll => Decision::Deny(DenyReason::ForbiddenForAll),
        AccessPolicy::Protected => {
            let mut granted = false;
            for role in &caller.roles {
                match route.override_for(*role) {
                    Some(false) => return Decision::Deny(DenyReason::ExplicitDeny),
                    Some(true) => granted = true,
                    None => {}
                }
            }
            if granted {
                Decision::Allow(AllowReason::ExplicitGrant)
            } else {
                Decision::Deny(DenyReason::ImplicitDeny)
            }
        }
    }
}

/// Where the evaluator found the rule it decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    /// Not looked up; the caller holds the highest-privilege role.
    Bypass,
    Registry,
    Storage,
    /// Not found anywhere.
    Missing,
}

/// A decision plus the rule it was based on.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub route: RouteKey,
    pub decision: Decision,
    pub source: RuleSource,
    pub rule: Option<RouteSnapshot>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Evaluator
// ═══════════════════════════════════════════════════════════════════════════════

/// The request-time evaluator. Cloning is cheap.
#[derive(Clone)]
pub struct PermissionEvaluator {
    roles: RoleStore,
    registry: RuleRegistry,
    store: Arc<dyn RbacStore>,
    service: Arc<str>,
    unassigned_routes_are_public: bool,
}

impl PermissionEvaluator {
    pub fn new(
        roles: RoleStore,
        registry: RuleRegistry,
        store: Arc<dyn RbacStore>,
        service: &str,
        unassigned_routes_are_public: bool,
    ) -> Self {
        Self {
            roles,
            registry,
            store,
            service: Arc::from(service),
            unassigned_routes_are_public,
        }
    }

    /// Decide whether `caller` may invoke `method path`.
    ///
    /// `path` is the route template, not the literal request path. Only a
    /// storage failure on the fallback path is an error.
    pub async fn evaluate(&self, method: &str, path: &str, caller: &Caller) -> RbacResult<Decision> {
        Ok(self.evaluate_detailed(method, path, caller).await?.decision)
    }

    /// Like [`evaluate`](Self::evaluate), but also reports the rule used.
    pub async fn evaluate_detailed(
        &self,
        method: &str,
        path: &str,
        caller: &Caller,
    ) -> RbacResult<Evaluation> {
        let start = Instant::now();
        let key = RouteKey::new(method, path);
        let result = self.run(key, caller).await;
        histogram!("rbac_evaluate_duration_seconds").record(start.elapsed().as_secs_f64());

        match &result {
            Ok(evaluation) => {
                let decision = evaluation.decision;
                counter!(
                    "rbac_decisions_total",
                    "outcome" => decision.outcome(),
                    "reason" => decision.reason_code()
                )
                .increment(1);
                match decision {
                    Decision::Allow(reason) => debug!(
                        route = %evaluation.route,
                        user_id = ?caller.user_id,
                        reason = reason.code(),
                        "Request allowed"
                    ),
                    Decision::Deny(reason) => warn!(
                        route = %evaluation.route,
                        user_id = ?caller.user_id,
                        roles = ?caller.roles,
                        reason = reason.code(),
                        "Request denied"
                    ),
                }
            }
            Err(e) => {
                counter!(
                    "rbac_decisions_total",
                    "outcome" => "error",
                    "reason" => "storage_unavailable"
                )
                .increment(1);
                error!(method, path, error = %e, "Permission evaluation failed");
            }
        }
        result
    }

    async fn run(&self, key: RouteKey, caller: &Caller) -> RbacResult<Evaluation> {
        let roles = self.roles.snapshot();
        if caller.roles.iter().any(|role| roles.is_highest_privilege(*role)) {
            return Ok(Evaluation {
                route: key,
                decision: Decision::Allow(AllowReason::HighestPrivilege),
                source: RuleSource::Bypass,
                rule: None,
            });
        }

        let registry = self.registry.snapshot();
        if let Some(route) = lookup(&registry, &key) {
            return Ok(Evaluation {
                decision: decide(route, caller),
                route: key,
                source: RuleSource::Registry,
                rule: Some(route.clone()),
            });
        }

        if self.unassigned_routes_are_public {
            return Ok(Evaluation {
                route: key,
                decision: Decision::Allow(AllowReason::UnassignedPublic),
                source: RuleSource::Missing,
                rule: None,
            });
        }

        match self.store.find_rule(&self.service, &key).await? {
            Some(rule) => {
                let permissions = self.store.rule_permissions(rule.id).await?;
                let route = RouteSnapshot::from_rule(&rule, &permissions);
                debug!(route = %key, rule_id = %rule.id, "Rule resolved from storage");
                Ok(Evaluation {
                    decision: decide(&route, caller),
                    route: key,
                    source: RuleSource::Storage,
                    rule: Some(route),
                })
            }
            None => Ok(Evaluation {
                route: key,
                decision: Decision::Deny(DenyReason::RuleNotFound),
                source: RuleSource::Missing,
                rule: None,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

/// Exact lookup; a HEAD request falls back to the GET route when no HEAD
/// route is declared.
fn lookup<'a>(registry: &'a RegistrySnapshot, key: &RouteKey) -> Option<&'a RouteSnapshot> {
    registry.get(key).or_else(|| {
        if key.method == "HEAD" {
            registry.get(&RouteKey::new("GET", &key.path))
        } else {
            None
        }
    })
}

impl fmt::Debug for PermissionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionEvaluator")
            .field("service", &self.service)
            .field("unassigned_routes_are_public", &self.unassigned_routes_are_public)
            .field("store", &self.store.backend_name())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::models::RuleId;
    use std::collections::BTreeMap;

    fn route(is_private: bool, policy: AccessPolicy, roles: &[(i32, Option<bool>)]) -> RouteSnapshot {
        RouteSnapshot {
            key: RouteKey::new("GET", "/api/rules"),
            rule_id: Some(RuleId(1)),
            is_private,
            access_policy: policy,
            roles: roles
                .iter()
                .map(|(id, allowed)| (RoleId(*id), *allowed))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn user(roles: &[i32]) -> Caller {
        Caller::authenticated("u1", roles.iter().map(|r| RoleId(*r)))
    }

    #[test]
    fn test_public_route_ignores_policy() {
        let r = route(false, AccessPolicy::ForbidAll, &[]);
        assert_eq!(decide(&r, &Caller::anonymous()), Decision::Allow(AllowReason::PublicRoute));
    }

    #[test]
    fn test_private_route_requires_identity() {
        let r = route(true, AccessPolicy::AllowAll, &[]);
        assert_eq!(decide(&r, &Caller::anonymous()), Decision::Deny(DenyReason::Unauthenticated));
        assert_eq!(decide(&r, &user(&[])), Decision::Allow(AllowReason::AllowAll));
    }

    #[test]
    fn test_no_roles_is_unauthenticated_unless_allow_all() {
        for policy in [AccessPolicy::Protected, AccessPolicy::ForbidAll] {
            let r = route(true, policy, &[(2, Some(true))]);
            assert_eq!(decide(&r, &user(&[])), Decision::Deny(DenyReason::Unauthenticated));
        }
    }

    #[test]
    fn test_forbid_all_beats_grants() {
        let r = route(true, AccessPolicy::ForbidAll, &[(2, Some(true))]);
        assert_eq!(decide(&r, &user(&[2])), Decision::Deny(DenyReason::ForbiddenForAll));
    }

    #[test]
    fn test_protected_grant_and_implicit_deny() {
        let r = route(true, AccessPolicy::Protected, &[(2, Some(true)), (3, None)]);
        assert_eq!(decide(&r, &user(&[2])), Decision::Allow(AllowReason::ExplicitGrant));
        assert_eq!(decide(&r, &user(&[3])), Decision::Deny(DenyReason::ImplicitDeny));
        assert_eq!(decide(&r, &user(&[4])), Decision::Deny(DenyReason::ImplicitDeny));
    }

    #[test]
    fn test_multi_role_grant_is_or() {
        let r = route(true, AccessPolicy::Protected, &[(3, Some(true))]);
        assert!(decide(&r, &user(&[2, 3])).is_allowed());
        let r = route(true, AccessPolicy::Protected, &[]);
        assert!(decide(&r, &user(&[2, 3])).is_denied());
    }

    #[test]
    fn test_explicit_deny_wins_over_grant() {
        let r = route(true, AccessPolicy::Protected, &[(2, Some(true)), (3, Some(false))]);
        assert_eq!(decide(&r, &user(&[2, 3])), Decision::Deny(DenyReason::ExplicitDeny));
        let r = route(true, AccessPolicy::Protected, &[(2, Some(false)), (3, Some(true))]);
        assert_eq!(decide(&r, &user(&[2, 3])), Decision::Deny(DenyReason::ExplicitDeny));
    }

    #[test]
    fn test_deny_reason_statuses() {
        assert_eq!(DenyReason::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(DenyReason::Unauthenticated.external_code(), "UNAUTHENTICATED");
        for reason in [
            DenyReason::ExplicitDeny,
            DenyReason::ImplicitDeny,
            DenyReason::ForbiddenForAll,
            DenyReason::RuleNotFound,
        ] {
            assert_eq!(reason.status(), StatusCode::FORBIDDEN);
            assert_eq!(reason.external_code(), "FORBIDDEN");
        }
    }

    #[test]
    fn test_locale_from_accept_language() {
        assert_eq!(Locale::from_accept_language("vi-VN,vi;q=0.9,en;q=0.8"), Locale::Vi);
        assert_eq!(Locale::from_accept_language("fr-FR, en-US;q=0.7"), Locale::En);
        assert_eq!(Locale::from_accept_language("de"), Locale::En);
        assert_eq!(Locale::from_accept_language(""), Locale::En);
        assert_ne!(
            DenyReason::ImplicitDeny.message(Locale::Vi),
            DenyReason::ImplicitDeny.message(Locale::En)
        );
    }

    #[test]
    fn test_decision_serializes_with_outcome_tag() {
        let json = serde_json::to_value(Decision::Deny(DenyReason::RuleNotFound)).unwrap();
        assert_eq!(json["outcome"], "deny");
        assert_eq!(json["reason"], "rule_not_found");
    }
}

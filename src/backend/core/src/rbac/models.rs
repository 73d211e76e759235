//! RBAC data model: roles, rules, per-role overrides and the in-memory route
//! snapshot the evaluator reads at request time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Methods a route declared for "any" method is registered under.
pub const ANY_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Database id of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub i32);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for RoleId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Database id of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub i32);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for RuleId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Opaque user identifier supplied by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role
// ═══════════════════════════════════════════════════════════════════════════════

/// A named role. Names are unique ignoring case and stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Role {
    pub fn new(id: impl Into<RoleId>, name: impl AsRef<str>) -> Self {
        Self {
            id: id.into(),
            name: normalize_role_name(name.as_ref()),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Canonical form of a role name.
pub fn normalize_role_name(name: &str) -> String {
    name.trim().to_lowercase()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Access Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Blanket policy a rule carries.
///
/// Persisted as a small integer: 1 = allow_all, 2 = protected, 3 = forbid_all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessPolicy {
    /// Any authenticated caller.
    AllowAll,
    /// Decided by per-role overrides; no override means deny.
    #[default]
    Protected,
    /// Nobody except the highest-privilege role.
    ForbidAll,
}

impl AccessPolicy {
    pub const fn as_i16(self) -> i16 {
        match self {
            Self::AllowAll => 1,
            Self::Protected => 2,
            Self::ForbidAll => 3,
        }
    }

    pub const fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::AllowAll),
            2 => Some(Self::Protected),
            3 => Some(Self::ForbidAll),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AllowAll => "allow_all",
            Self::Protected => "protected",
            Self::ForbidAll => "forbid_all",
        }
    }
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "allow_all" | "1" => Ok(Self::AllowAll),
            "protected" | "2" => Ok(Self::Protected),
            "forbid_all" | "3" => Ok(Self::ForbidAll),
            other => Err(format!("unknown access policy: {}", other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Route Key
// ═══════════════════════════════════════════════════════════════════════════════

/// (method, template path) identifying a route within one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub method: String,
    pub path: String,
}

impl RouteKey {
    /// Build a key, uppercasing the method and collapsing repeated slashes.
    pub fn new(method: impl AsRef<str>, path: impl AsRef<str>) -> Self {
        Self {
            method: method.as_ref().trim().to_ascii_uppercase(),
            path: normalize_path(path.as_ref()),
        }
    }

    /// `METHOD|path`, the form obsolescence is computed on.
    pub fn sync_key(&self) -> String {
        format!("{}|{}", self.method, self.path)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Collapse runs of `/` into one.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.trim().chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

/// Prefix `root` onto `path` unless the path already lives under it.
///
/// The check is segment-aware: `/apiary` is not under `/api`.
pub fn qualify_path(root: &str, path: &str) -> String {
    let root = normalize_path(root);
    let root = root.trim_end_matches('/');
    let mut path = normalize_path(path);
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    if root.is_empty() || path == root || path.starts_with(&format!("{}/", root)) {
        return path;
    }
    normalize_path(&format!("{}{}", root, path))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule / Permission rows
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub method: String,
    pub path: String,
    pub service: String,
    pub is_private: bool,
    pub access_policy: AccessPolicy,
}

impl Rule {
    pub fn key(&self) -> RouteKey {
        RouteKey::new(&self.method, &self.path)
    }
}

/// A rule about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRule {
    pub method: String,
    pub path: String,
    pub service: String,
    pub is_private: bool,
    pub access_policy: AccessPolicy,
}

/// Per-(rule, role) override. `allowed = None` defers to the rule's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePermission {
    pub rule_id: RuleId,
    pub role_id: RoleId,
    pub allowed: Option<bool>,
}

impl RulePermission {
    pub fn new(rule_id: RuleId, role_id: RoleId, allowed: Option<bool>) -> Self {
        Self {
            rule_id,
            role_id,
            allowed,
        }
    }
}

/// A user holding a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRoleAssignment {
    pub user_id: UserId,
    pub role_id: RoleId,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Route Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// Denormalized rule + overrides, as held in the committed registry.
///
/// `rule_id` is `None` for a route that has been declared but not yet
/// persisted; its `roles` then come from the declaration's role expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSnapshot {
    pub key: RouteKey,
    pub rule_id: Option<RuleId>,
    pub is_private: bool,
    pub access_policy: AccessPolicy,
    pub roles: BTreeMap<RoleId, Option<bool>>,
}

impl RouteSnapshot {
    /// Build from a persisted rule and its permission rows.
    pub fn from_rule<'a>(rule: &Rule, permissions: impl IntoIterator<Item = &'a RulePermission>) -> Self {
        let roles = permissions
            .into_iter()
            .filter(|p| p.rule_id == rule.id)
            .map(|p| (p.role_id, p.allowed))
            .collect();
        Self {
            key: rule.key(),
            rule_id: Some(rule.id),
            is_private: rule.is_private,
            access_policy: rule.access_policy,
            roles,
        }
    }

    /// Explicit override for a role, if one is recorded.
    pub fn override_for(&self, role: RoleId) -> Option<bool> {
        self.roles.get(&role).copied().flatten()
    }

    pub fn is_persisted(&self) -> bool {
        self.rule_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_collapses_slashes() {
        assert_eq!(normalize_path("//api///rules//"), "/api/rules/");
        assert_eq!(normalize_path("/api/rules"), "/api/rules");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_qualify_path_adds_root_once() {
        assert_eq!(qualify_path("/api", "/rules"), "/api/rules");
        assert_eq!(qualify_path("/api", "/api/rules"), "/api/rules");
        assert_eq!(qualify_path("/api", "rules"), "/api/rules");
        assert_eq!(qualify_path("/api", "/api"), "/api");
        assert_eq!(qualify_path("/api/", "//rules"), "/api/rules");
    }

    #[test]
    fn test_qualify_path_is_segment_aware() {
        assert_eq!(qualify_path("/api", "/apiary"), "/api/apiary");
    }

    #[test]
    fn test_route_key_uppercases_method() {
        let key = RouteKey::new("get", "/api//rules");
        assert_eq!(key.method, "GET");
        assert_eq!(key.path, "/api/rules");
        assert_eq!(key.to_string(), "GET /api/rules");
        assert_eq!(key.sync_key(), "GET|/api/rules");
    }

    #[test]
    fn test_access_policy_codes() {
        for policy in [AccessPolicy::AllowAll, AccessPolicy::Protected, AccessPolicy::ForbidAll] {
            assert_eq!(AccessPolicy::from_i16(policy.as_i16()), Some(policy));
            assert_eq!(policy.as_str().parse::<AccessPolicy>(), Ok(policy));
        }
        assert_eq!(AccessPolicy::from_i16(0), None);
        assert!("sometimes".parse::<AccessPolicy>().is_err());
        assert_eq!("forbid-all".parse::<AccessPolicy>(), Ok(AccessPolicy::ForbidAll));
    }

    #[test]
    fn test_access_policy_serde() {
        let json = serde_json::to_string(&AccessPolicy::AllowAll).unwrap();
        assert_eq!(json, "\"allow_all\"");
    }

    #[test]
    fn test_role_name_is_lowercased() {
        let role = Role::new(2, "  Editor ");
        assert_eq!(role.name, "editor");
        assert_eq!(role.id, RoleId(2));
    }

    #[test]
    fn test_snapshot_from_rule_filters_foreign_rows() {
        let rule = Rule {
            id: RuleId(7),
            method: "GET".into(),
            path: "/api/rules".into(),
            service: "svc".into(),
            is_private: true,
            access_policy: AccessPolicy::Protected,
        };
        let perms = vec![
            RulePermission::new(RuleId(7), RoleId(2), Some(true)),
            RulePermission::new(RuleId(7), RoleId(3), None),
            RulePermission::new(RuleId(8), RoleId(4), Some(false)),
        ];

        let snap = RouteSnapshot::from_rule(&rule, &perms);
        assert_eq!(snap.roles.len(), 2);
        assert_eq!(snap.override_for(RoleId(2)), Some(true));
        assert_eq!(snap.override_for(RoleId(3)), None);
        assert_eq!(snap.override_for(RoleId(4)), None);
        assert!(snap.is_persisted());
    }
}

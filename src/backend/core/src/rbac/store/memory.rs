//! In-memory [`RbacStore`].
//!
//! Keeps the same invariants the relational schema enforces: case-insensitive
//! unique role names, one rule per (path, method, service), one permission row
//! per (rule, role), and cascading deletes from rules to permissions. State is
//! lost on restart.
//!
//! With the `test-util` feature two failure switches exist for exercising
//! error paths: the whole store can be marked unavailable, and rule inserts
//! for selected paths can be made to fail.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{RbacStore, RuleInsert};
use crate::rbac::error::{RbacError, RbacResult};
use crate::rbac::models::{
    normalize_role_name, AccessPolicy, NewRule, Role, RoleId, RouteKey, Rule, RuleId,
    RulePermission, UserId,
};

#[derive(Debug, Default)]
struct State {
    next_role_id: i32,
    next_rule_id: i32,
    roles: BTreeMap<RoleId, Role>,
    rules: BTreeMap<RuleId, Rule>,
    user_roles: BTreeSet<(UserId, RoleId)>,
    permissions: BTreeMap<(RuleId, RoleId), Option<bool>>,
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    failing_paths: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with roles, in order, ids starting at 1.
    pub fn with_roles<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        {
            let mut state = store.state.lock();
            for name in names {
                Self::create_role(&mut state, name.as_ref());
            }
        }
        store
    }

    /// Make every call fail with `StorageUnavailable` until switched back.
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `insert_rule` fail for the given path.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_inserts_for(&self, path: impl Into<String>) {
        self.failing_paths.lock().insert(path.into());
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_failures(&self) {
        self.failing_paths.lock().clear();
    }

    /// Write a permission row without checking that its rule exists.
    #[cfg(any(test, feature = "test-util"))]
    pub fn insert_raw_permission(&self, permission: RulePermission) {
        self.state
            .lock()
            .permissions
            .insert((permission.rule_id, permission.role_id), permission.allowed);
    }

    pub fn rule_count(&self) -> usize {
        self.state.lock().rules.len()
    }

    pub fn permission_count(&self) -> usize {
        self.state.lock().permissions.len()
    }

    fn check(&self) -> RbacResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RbacError::storage("memory store marked unavailable"));
        }
        Ok(())
    }

    fn create_role(state: &mut State, name: &str) -> Role {
        state.next_role_id += 1;
        let role = Role::new(state.next_role_id, name);
        state.roles.insert(role.id, role.clone());
        role
    }

    fn find_rule_in(state: &State, service: &str, method: &str, path: &str) -> Option<Rule> {
        state
            .rules
            .values()
            .find(|r| r.service == service && r.method == method && r.path == path)
            .cloned()
    }
}

#[async_trait]
impl RbacStore for MemoryStore {
    async fn list_roles(&self) -> RbacResult<Vec<Role>> {
        self.check()?;
        Ok(self.state.lock().roles.values().cloned().collect())
    }

    async fn ensure_role(&self, name: &str) -> RbacResult<(Role, bool)> {
        self.check()?;
        let wanted = normalize_role_name(name);
        if wanted.is_empty() {
            return Err(RbacError::InvalidInput("role name must not be empty".into()));
        }
        let mut state = self.state.lock();
        if let Some(role) = state.roles.values().find(|r| r.name == wanted) {
            return Ok((role.clone(), false));
        }
        Ok((Self::create_role(&mut state, &wanted), true))
    }

    async fn user_role_ids(&self, user_id: &UserId) -> RbacResult<Vec<RoleId>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .user_roles
            .iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, role)| *role)
            .collect())
    }

    async fn assign_user_role(&self, user_id: &UserId, role_id: RoleId) -> RbacResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.roles.contains_key(&role_id) {
            return Err(RbacError::RoleNotFound(role_id.to_string()));
        }
        Ok(state.user_roles.insert((user_id.clone(), role_id)))
    }

    async fn revoke_user_role(&self, user_id: &UserId, role_id: RoleId) -> RbacResult<bool> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .user_roles
            .remove(&(user_id.clone(), role_id)))
    }

    async fn list_rules(&self, service: &str) -> RbacResult<Vec<Rule>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .rules
            .values()
            .filter(|r| r.service == service)
            .cloned()
            .collect())
    }

    async fn find_rule(&self, service: &str, key: &RouteKey) -> RbacResult<Option<Rule>> {
        self.check()?;
        let state = self.state.lock();
        Ok(Self::find_rule_in(&state, service, &key.method, &key.path))
    }

    async fn get_rule(&self, rule_id: RuleId) -> RbacResult<Option<Rule>> {
        self.check()?;
        Ok(self.state.lock().rules.get(&rule_id).cloned())
    }

    async fn insert_rule(&self, rule: &NewRule) -> RbacResult<RuleInsert> {
        self.check()?;
        if self.failing_paths.lock().contains(&rule.path) {
            return Err(RbacError::storage(format!(
                "injected insert failure for {}",
                rule.path
            )));
        }
        let mut state = self.state.lock();
        if let Some(existing) = Self::find_rule_in(&state, &rule.service, &rule.method, &rule.path)
        {
            return Ok(RuleInsert::AlreadyExists(existing));
        }
        state.next_rule_id += 1;
        let created = Rule {
            id: RuleId(state.next_rule_id),
            method: rule.method.clone(),
            path: rule.path.clone(),
            service: rule.service.clone(),
            is_private: rule.is_private,
            access_policy: rule.access_policy,
        };
        state.rules.insert(created.id, created.clone());
        Ok(RuleInsert::Created(created))
    }

    async fn update_rule_privacy(&self, rule_id: RuleId, is_private: bool) -> RbacResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        let rule = state
            .rules
            .get_mut(&rule_id)
            .ok_or(RbacError::RuleNotFound(rule_id))?;
        rule.is_private = is_private;
        Ok(())
    }

    async fn set_rule_policy(&self, rule_id: RuleId, policy: AccessPolicy) -> RbacResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        match state.rules.get_mut(&rule_id) {
            Some(rule) => {
                rule.access_policy = policy;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_rules(&self, rule_ids: &[RuleId]) -> RbacResult<u64> {
        self.check()?;
        let mut state = self.state.lock();
        let mut deleted = 0;
        for id in rule_ids {
            if state.rules.remove(id).is_some() {
                deleted += 1;
                state.permissions.retain(|(rule, _), _| rule != id);
            }
        }
        Ok(deleted)
    }

    async fn list_permissions(&self, service: &str) -> RbacResult<Vec<RulePermission>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .permissions
            .iter()
            .filter(|((rule, _), _)| {
                state
                    .rules
                    .get(rule)
                    .map(|r| r.service == service)
                    .unwrap_or(false)
            })
            .map(|((rule, role), allowed)| RulePermission::new(*rule, *role, *allowed))
            .collect())
    }

    async fn rule_permissions(&self, rule_id: RuleId) -> RbacResult<Vec<RulePermission>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .permissions
            .iter()
            .filter(|((rule, _), _)| *rule == rule_id)
            .map(|((rule, role), allowed)| RulePermission::new(*rule, *role, *allowed))
            .collect())
    }

    async fn insert_permission(&self, permission: &RulePermission) -> RbacResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.rules.contains_key(&permission.rule_id) {
            return Err(RbacError::RuleNotFound(permission.rule_id));
        }
        if !state.roles.contains_key(&permission.role_id) {
            return Err(RbacError::RoleNotFound(permission.role_id.to_string()));
        }
        let key = (permission.rule_id, permission.role_id);
        if state.permissions.contains_key(&key) {
            return Ok(false);
        }
        state.permissions.insert(key, permission.allowed);
        Ok(true)
    }

    async fn upsert_permission(&self, permission: &RulePermission) -> RbacResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.rules.contains_key(&permission.rule_id) {
            return Err(RbacError::RuleNotFound(permission.rule_id));
        }
        if !state.roles.contains_key(&permission.role_id) {
            return Err(RbacError::RoleNotFound(permission.role_id.to_string()));
        }
        state
            .permissions
            .insert((permission.rule_id, permission.role_id), permission.allowed);
        Ok(())
    }

    async fn delete_permission(&self, rule_id: RuleId, role_id: RoleId) -> RbacResult<bool> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .permissions
            .remove(&(rule_id, role_id))
            .is_some())
    }

    async fn orphaned_permissions(&self) -> RbacResult<Vec<RulePermission>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .permissions
            .iter()
            .filter(|((rule, _), _)| !state.rules.contains_key(rule))
            .map(|((rule, role), allowed)| RulePermission::new(*rule, *role, *allowed))
            .collect())
    }

    async fn delete_orphaned_permissions(&self) -> RbacResult<u64> {
        self.check()?;
        let mut state = self.state.lock();
        let State {
            rules, permissions, ..
        } = &mut *state;
        let before = permissions.len();
        permissions.retain(|(rule, _), _| rules.contains_key(rule));
        Ok((before - permissions.len()) as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_rule(path: &str) -> NewRule {
        NewRule {
            method: "GET".into(),
            path: path.into(),
            service: "svc".into(),
            is_private: true,
            access_policy: AccessPolicy::Protected,
        }
    }

    #[tokio::test]
    async fn test_role_names_are_case_insensitive() {
        let store = MemoryStore::with_roles(["admin"]);
        let (role, created) = store.ensure_role("ADMIN").await.unwrap();
        assert!(!created);
        assert_eq!(role.id, RoleId(1));

        let (editor, created) = store.ensure_role("Editor").await.unwrap();
        assert!(created);
        assert_eq!(editor.name, "editor");
        assert_eq!(editor.id, RoleId(2));
    }

    #[tokio::test]
    async fn test_insert_rule_is_unique() {
        let store = MemoryStore::new();
        let first = store.insert_rule(&new_rule("/api/a")).await.unwrap();
        let second = store.insert_rule(&new_rule("/api/a")).await.unwrap();
        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.rule().id, second.rule().id);
        assert_eq!(store.rule_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_rule_cascades() {
        let store = MemoryStore::with_roles(["admin", "editor"]);
        let rule = store.insert_rule(&new_rule("/api/a")).await.unwrap().into_rule();
        store
            .insert_permission(&RulePermission::new(rule.id, RoleId(2), Some(true)))
            .await
            .unwrap();
        assert_eq!(store.permission_count(), 1);

        assert_eq!(store.delete_rules(&[rule.id]).await.unwrap(), 1);
        assert_eq!(store.permission_count(), 0);
    }

    #[tokio::test]
    async fn test_insert_permission_skips_duplicates() {
        let store = MemoryStore::with_roles(["admin"]);
        let rule = store.insert_rule(&new_rule("/api/a")).await.unwrap().into_rule();
        let perm = RulePermission::new(rule.id, RoleId(1), None);
        assert!(store.insert_permission(&perm).await.unwrap());
        assert!(!store
            .insert_permission(&RulePermission::new(rule.id, RoleId(1), Some(false)))
            .await
            .unwrap());
        let rows = store.rule_permissions(rule.id).await.unwrap();
        assert_eq!(rows, vec![perm]);
    }

    #[tokio::test]
    async fn test_orphans_are_detected_and_removed() {
        let store = MemoryStore::with_roles(["admin"]);
        store.insert_raw_permission(RulePermission::new(RuleId(99), RoleId(1), Some(true)));
        assert_eq!(store.orphaned_permissions().await.unwrap().len(), 1);
        assert_eq!(store.delete_orphaned_permissions().await.unwrap(), 1);
        assert!(store.orphaned_permissions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::with_roles(["admin"]);
        store.set_unavailable(true);
        assert!(store.list_roles().await.unwrap_err().is_storage());
        store.set_unavailable(false);
        assert_eq!(store.list_roles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_insert_failure() {
        let store = MemoryStore::new();
        store.fail_inserts_for("/api/broken");
        assert!(store.insert_rule(&new_rule("/api/broken")).await.is_err());
        assert!(store.insert_rule(&new_rule("/api/fine")).await.is_ok());
    }
}

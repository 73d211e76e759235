//! Runtime role directory.
//!
//! Holds the role name ↔ id map loaded from storage. Readers take an `Arc`
//! to the current snapshot without locking; [`RoleStore::load`] builds a new
//! snapshot and swaps it in whole.

use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use super::error::RbacResult;
use super::models::{normalize_role_name, Role, RoleId};
use super::store::RbacStore;

/// Immutable view of the roles known at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RoleSnapshot {
    by_id: BTreeMap<RoleId, Role>,
    by_name: HashMap<String, RoleId>,
    highest: Option<RoleId>,
}

impl RoleSnapshot {
    /// Build a snapshot, resolving the highest-privilege role by name.
    pub fn new(roles: impl IntoIterator<Item = Role>, highest_role: &str) -> Self {
        let highest_name = normalize_role_name(highest_role);
        let mut snapshot = Self::default();
        for role in roles {
            let name = normalize_role_name(&role.name);
            if name == highest_name {
                snapshot.highest = Some(role.id);
            }
            snapshot.by_name.insert(name, role.id);
            snapshot.by_id.insert(role.id, role);
        }
        snapshot
    }

    pub fn lookup(&self, name: &str) -> Option<RoleId> {
        self.by_name.get(&normalize_role_name(name)).copied()
    }

    pub fn get(&self, id: RoleId) -> Option<&Role> {
        self.by_id.get(&id)
    }

    pub fn name_of(&self, id: RoleId) -> Option<&str> {
        self.by_id.get(&id).map(|r| r.name.as_str())
    }

    pub fn contains(&self, id: RoleId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn highest(&self) -> Option<RoleId> {
        self.highest
    }

    pub fn is_highest_privilege(&self, id: RoleId) -> bool {
        self.highest == Some(id)
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> Vec<RoleId> {
        self.by_id.keys().copied().collect()
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Shared handle to the role directory. Cloning is cheap.
#[derive(Clone)]
pub struct RoleStore {
    current: Arc<ArcSwap<RoleSnapshot>>,
    highest_role: Arc<str>,
}

impl RoleStore {
    pub fn new(highest_role: &str) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(RoleSnapshot::default())),
            highest_role: Arc::from(normalize_role_name(highest_role)),
        }
    }

    /// Read every role from storage and replace the current snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn load(&self, store: &dyn RbacStore) -> RbacResult<Arc<RoleSnapshot>> {
        let roles = store.list_roles().await?;
        Ok(self.replace(roles))
    }

    /// Swap in a snapshot built from `roles`.
    pub fn replace(&self, roles: Vec<Role>) -> Arc<RoleSnapshot> {
        let snapshot = Arc::new(RoleSnapshot::new(roles, &self.highest_role));
        if snapshot.highest().is_none() && !snapshot.is_empty() {
            warn!(
                highest_role = %self.highest_role,
                "Configured highest-privilege role does not exist; no caller will bypass checks"
            );
        }
        info!(roles = snapshot.len(), "Role directory loaded");
        self.current.store(snapshot.clone());
        snapshot
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<RoleSnapshot> {
        self.current.load_full()
    }

    pub fn lookup(&self, name: &str) -> Option<RoleId> {
        self.current.load().lookup(name)
    }

    pub fn is_highest_privilege(&self, id: RoleId) -> bool {
        self.current.load().is_highest_privilege(id)
    }

    pub fn highest_role_name(&self) -> &str {
        &self.highest_role
    }
}

impl std::fmt::Debug for RoleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleStore")
            .field("highest_role", &self.highest_role)
            .field("roles", &self.current.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::store::MemoryStore;

    #[test]
    fn test_snapshot_lookup_ignores_case() {
        let snap = RoleSnapshot::new(vec![Role::new(1, "admin"), Role::new(2, "editor")], "Admin");
        assert_eq!(snap.lookup("EDITOR"), Some(RoleId(2)));
        assert_eq!(snap.lookup("viewer"), None);
        assert_eq!(snap.highest(), Some(RoleId(1)));
        assert!(snap.is_highest_privilege(RoleId(1)));
        assert!(!snap.is_highest_privilege(RoleId(2)));
        assert_eq!(snap.name_of(RoleId(2)), Some("editor"));
    }

    #[test]
    fn test_missing_highest_role() {
        let snap = RoleSnapshot::new(vec![Role::new(1, "editor")], "admin");
        assert_eq!(snap.highest(), None);
        assert!(!snap.is_highest_privilege(RoleId(1)));
    }

    #[test]
    fn test_load_swaps_snapshot() {
        let store = MemoryStore::with_roles(["admin", "editor"]);
        let roles = RoleStore::new("admin");
        assert!(roles.snapshot().is_empty());

        let before = roles.snapshot();
        tokio_test::block_on(roles.load(&store)).unwrap();

        assert!(before.is_empty());
        assert_eq!(roles.snapshot().len(), 2);
        assert_eq!(roles.lookup("editor"), Some(RoleId(2)));
        assert!(roles.is_highest_privilege(RoleId(1)));
    }

    #[test]
    fn test_failed_load_keeps_previous_snapshot() {
        let store = MemoryStore::with_roles(["admin"]);
        let roles = RoleStore::new("admin");
        tokio_test::block_on(roles.load(&store)).unwrap();

        store.set_unavailable(true);
        let err = tokio_test::block_on(roles.load(&store)).unwrap_err();
        assert!(err.is_storage());
        assert_eq!(roles.snapshot().len(), 1);
    }
}

//! Caller resolution: user id → held roles.

use std::sync::Arc;
use tracing::debug;

use super::error::RbacResult;
use super::models::UserId;
use super::policy::Caller;
use super::store::RbacStore;
use crate::middleware::auth::AuthContext;

/// Resolves the roles a user holds from the `user_roles` table.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn RbacStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn RbacStore>) -> Self {
        Self { store }
    }

    /// Anonymous when `user_id` is `None`; otherwise the user's role set,
    /// which may be empty.
    pub async fn resolve(&self, user_id: Option<&UserId>) -> RbacResult<Caller> {
        let Some(user_id) = user_id else {
            return Ok(Caller::anonymous());
        };
        let roles = self.store.user_role_ids(user_id).await?;
        debug!(user_id = %user_id, roles = roles.len(), "Caller resolved");
        Ok(Caller::authenticated(user_id.clone(), roles))
    }

    /// Resolve the caller behind an authentication context.
    pub async fn resolve_auth(&self, auth: &AuthContext) -> RbacResult<Caller> {
        if !auth.is_authenticated() {
            return Ok(Caller::anonymous());
        }
        self.resolve(Some(&UserId::new(auth.user_id.clone()))).await
    }
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("store", &self.store.backend_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::models::RoleId;
    use crate::rbac::store::MemoryStore;

    #[tokio::test]
    async fn test_resolve_user_roles() {
        let store = Arc::new(MemoryStore::with_roles(["admin", "editor", "viewer"]));
        let user = UserId::new("u2");
        store.assign_user_role(&user, RoleId(2)).await.unwrap();
        store.assign_user_role(&user, RoleId(3)).await.unwrap();

        let resolver = IdentityResolver::new(store);
        let caller = resolver.resolve(Some(&user)).await.unwrap();
        assert!(caller.is_authenticated());
        assert_eq!(caller.roles.into_iter().collect::<Vec<_>>(), vec![RoleId(2), RoleId(3)]);
    }

    #[tokio::test]
    async fn test_resolve_without_user_is_anonymous() {
        let resolver = IdentityResolver::new(Arc::new(MemoryStore::new()));
        let caller = resolver.resolve(None).await.unwrap();
        assert_eq!(caller, Caller::anonymous());

        let caller = resolver.resolve_auth(&AuthContext::anonymous("req-1")).await.unwrap();
        assert!(!caller.is_authenticated());
    }

    #[tokio::test]
    async fn test_user_without_roles_is_authenticated_with_empty_set() {
        let resolver = IdentityResolver::new(Arc::new(MemoryStore::with_roles(["admin"])));
        let caller = resolver.resolve(Some(&UserId::new("nobody"))).await.unwrap();
        assert!(caller.is_authenticated());
        assert!(caller.roles.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let resolver = IdentityResolver::new(store);
        assert!(resolver.resolve(Some(&UserId::new("u1"))).await.unwrap_err().is_storage());
    }
}

//! Reconciliation of persisted rules with declared routes.
//!
//! A pass walks the fresh set in key order and, for each route:
//!
//! - exact (path, method, service) match: only `is_private` is brought in
//!   line. The access policy and overrides belong to the operator.
//! - no match, but an obsolete rule with the same method exists: the route
//!   is treated as moved. A new rule is created and the old rule's overrides
//!   are copied onto it (rows the new rule already has are kept).
//! - otherwise a new rule is created and seeded with the overrides its role
//!   expression resolved to.
//!
//! Then two independent sweeps run: rules of the service that are no longer
//! declared are deleted (permissions cascade), and permission rows pointing at
//! no rule at all are deleted.
//!
//! A failing route is recorded in [`SyncReport::failures`] and the pass moves
//! on. Callers serialize passes with reloads; see [`Rbac`](super::Rbac).

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::error::{RbacError, RbacResult, RouteFailure};
use super::models::{AccessPolicy, NewRule, RoleId, RouteKey, Rule, RuleId, RulePermission};
use super::registry::{DeclaredRoute, RuleRegistry};
use super::roles::{RoleSnapshot, RoleStore};
use super::store::{RbacStore, RuleInsert};

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Summary of one synchronization pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub service: String,
    pub fresh_routes: usize,
    pub created: usize,
    pub moved: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub permissions_seeded: usize,
    pub permissions_migrated: usize,
    pub obsolete_deleted: u64,
    pub orphans_deleted: u64,
    /// True when no routes were declared and only the orphan sweep ran.
    pub skipped: bool,
    pub failures: Vec<RouteFailure>,
    pub sweep_errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.sweep_errors.is_empty()
    }

    /// Turn recorded failures into an error.
    pub fn ensure_complete(self) -> RbacResult<Self> {
        if !self.failures.is_empty() {
            return Err(RbacError::ReconciliationPartialFailure {
                failures: self.failures,
            });
        }
        if let Some(first) = self.sweep_errors.first() {
            return Err(RbacError::StorageUnavailable(first.clone()));
        }
        Ok(self)
    }
}

/// How [`ReconciliationEngine::assign_defaults`] picks roles for a rule that
/// has no permission rows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "role_ids", rename_all = "snake_case")]
pub enum AssignStrategy {
    /// `AllowAll` rules get every role; `Protected` and `ForbidAll` rules get
    /// the highest-privilege role (or the first role if it does not exist).
    #[default]
    ByPolicy,
    AllRoles,
    Specific(Vec<RoleId>),
}

/// Summary of a default-assignment pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignReport {
    pub rules_without_permissions: usize,
    pub rules_assigned: usize,
    pub permissions_created: usize,
}

/// Storage health of the rule tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub service: String,
    pub total_rules: usize,
    pub total_permissions: usize,
    pub rules_without_permissions: Vec<RouteKey>,
    pub orphaned_permissions: usize,
    /// Declared routes with no persisted rule.
    pub unpersisted_routes: Vec<RouteKey>,
    /// Persisted rules no longer declared. Empty when nothing is declared.
    pub undeclared_rules: Vec<RouteKey>,
    pub is_healthy: bool,
}

enum RouteOutcome {
    Unchanged,
    Updated,
    Created { seeded: usize },
    Moved { from: RuleId, migrated: usize },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Brings persisted rules in line with the declared routes.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn RbacStore>,
    registry: RuleRegistry,
    roles: RoleStore,
    service: Arc<str>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn RbacStore>, registry: RuleRegistry, roles: RoleStore, service: &str) -> Self {
        Self {
            store,
            registry,
            roles,
            service: Arc::from(service),
        }
    }

    /// Run one pass with a deadline on the whole pass.
    pub async fn synchronize_within(&self, deadline: Duration) -> RbacResult<SyncReport> {
        match tokio::time::timeout(deadline, self.synchronize()).await {
            Ok(result) => result,
            Err(_) => {
                counter!("rbac_reconcile_runs_total", "outcome" => "timeout").increment(1);
                warn!(service = %self.service, ?deadline, "Reconciliation exceeded its deadline");
                Err(RbacError::DeadlineExceeded(deadline))
            }
        }
    }

    /// Run one pass. Only a failure to read the current rules aborts it.
    pub async fn synchronize(&self) -> RbacResult<SyncReport> {
        let start = Instant::now();
        let fresh = self.registry.fresh_routes();
        let mut report = SyncReport {
            service: self.service.to_string(),
            fresh_routes: fresh.len(),
            ..Default::default()
        };

        if fresh.is_empty() {
            warn!(service = %self.service, "No routes declared; rule reconciliation skipped");
            report.skipped = true;
            self.sweep_orphans(&mut report).await;
            report.duration_ms = start.elapsed().as_millis() as u64;
            counter!("rbac_reconcile_runs_total", "outcome" => "skipped").increment(1);
            return Ok(report);
        }

        let persisted = match self.store.list_rules(&self.service).await {
            Ok(rules) => rules,
            Err(e) => {
                counter!("rbac_reconcile_runs_total", "outcome" => "error").increment(1);
                return Err(e);
            }
        };
        let fresh_keys: HashSet<String> = fresh.iter().map(|r| r.key.sync_key()).collect();
        let by_key: HashMap<String, &Rule> = persisted.iter().map(|r| (r.key().sync_key(), r)).collect();

        let mut candidates: BTreeMap<String, Vec<&Rule>> = BTreeMap::new();
        for rule in persisted.iter().filter(|r| !fresh_keys.contains(&r.key().sync_key())) {
            candidates.entry(rule.method.to_ascii_uppercase()).or_default().push(rule);
        }
        for rules in candidates.values_mut() {
            rules.sort_by_key(|r| r.id);
        }

        let roles = self.roles.snapshot();
        let mut retained: HashSet<RuleId> = HashSet::new();

        for declared in &fresh {
            let existing = by_key.get(&declared.key.sync_key()).copied();
            let candidate = match existing {
                Some(_) => None,
                None => take_candidate(&mut candidates, &declared.key),
            };

            match self.sync_route(declared, existing, candidate, &roles).await {
                Ok(RouteOutcome::Unchanged) => report.unchanged += 1,
                Ok(RouteOutcome::Updated) => report.updated += 1,
                Ok(RouteOutcome::Created { seeded }) => {
                    report.created += 1;
                    report.permissions_seeded += seeded;
                }
                Ok(RouteOutcome::Moved { from, migrated }) => {
                    debug!(route = %declared.key, from = %from, migrated, "Route moved");
                    report.moved += 1;
                    report.permissions_migrated += migrated;
                }
                Err(e) => {
                    warn!(route = %declared.key, error = %e, "Route failed to reconcile");
                    if let Some(old) = candidate {
                        retained.insert(old.id);
                    }
                    report.failures.push(RouteFailure {
                        route: declared.key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let obsolete: Vec<RuleId> = persisted
            .iter()
            .filter(|r| !fresh_keys.contains(&r.key().sync_key()) && !retained.contains(&r.id))
            .map(|r| r.id)
            .collect();
        if !obsolete.is_empty() {
            match self.store.delete_rules(&obsolete).await {
                Ok(deleted) => report.obsolete_deleted = deleted,
                Err(e) => {
                    warn!(error = %e, "Obsolete rule sweep failed");
                    report.sweep_errors.push(format!("obsolete sweep: {}", e));
                }
            }
        }

        self.sweep_orphans(&mut report).await;

        report.duration_ms = start.elapsed().as_millis() as u64;
        let outcome = if report.is_complete() { "ok" } else { "partial" };
        counter!("rbac_reconcile_runs_total", "outcome" => outcome).increment(1);
        info!(
            service = %report.service,
            fresh = report.fresh_routes,
            created = report.created,
            moved = report.moved,
            updated = report.updated,
            unchanged = report.unchanged,
            obsolete_deleted = report.obsolete_deleted,
            orphans_deleted = report.orphans_deleted,
            failures = report.failures.len(),
            duration_ms = report.duration_ms,
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Delete permission rows whose rule no longer exists.
    async fn sweep_orphans(&self, report: &mut SyncReport) {
        match self.store.delete_orphaned_permissions().await {
            Ok(deleted) => report.orphans_deleted = deleted,
            Err(e) => {
                warn!(error = %e, "Orphan permission sweep failed");
                report.sweep_errors.push(format!("orphan sweep: {}", e));
            }
        }
    }

    async fn sync_route(
        &self,
        declared: &DeclaredRoute,
        existing: Option<&Rule>,
        candidate: Option<&Rule>,
        roles: &RoleSnapshot,
    ) -> RbacResult<RouteOutcome> {
        if let Some(rule) = existing {
            return self.align_privacy(rule, declared.is_private).await;
        }

        let insert = self
            .store
            .insert_rule(&NewRule {
                method: declared.key.method.clone(),
                path: declared.key.path.clone(),
                service: self.service.to_string(),
                is_private: declared.is_private,
                access_policy: declared.access_policy(),
            })
            .await?;

        let created = match insert {
            RuleInsert::Created(rule) => rule,
            // Another writer got there first; treat it as an existing rule.
            RuleInsert::AlreadyExists(rule) => return self.align_privacy(&rule, declared.is_private).await,
        };

        match candidate {
            Some(old) => match self.migrate_permissions(old.id, created.id).await {
                Ok(migrated) => Ok(RouteOutcome::Moved { from: old.id, migrated }),
                Err(e) => {
                    // Without the new rule the next pass retries the move.
                    if let Err(rollback) = self.store.delete_rules(&[created.id]).await {
                        warn!(rule_id = %created.id, error = %rollback, "Failed to roll back moved rule");
                    }
                    Err(e)
                }
            },
            None => {
                let mut seeded = 0;
                for (role, allowed) in &declared.access.roles {
                    if !roles.contains(*role) {
                        continue;
                    }
                    let row = RulePermission::new(created.id, *role, Some(*allowed));
                    if self.store.insert_permission(&row).await? {
                        seeded += 1;
                    }
                }
                Ok(RouteOutcome::Created { seeded })
            }
        }
    }

    async fn align_privacy(&self, rule: &Rule, is_private: bool) -> RbacResult<RouteOutcome> {
        if rule.is_private == is_private {
            return Ok(RouteOutcome::Unchanged);
        }
        self.store.update_rule_privacy(rule.id, is_private).await?;
        debug!(rule_id = %rule.id, is_private, "Rule privacy updated");
        Ok(RouteOutcome::Updated)
    }

    async fn migrate_permissions(&self, from: RuleId, to: RuleId) -> RbacResult<usize> {
        let mut migrated = 0;
        for row in self.store.rule_permissions(from).await? {
            if self
                .store
                .insert_permission(&RulePermission::new(to, row.role_id, row.allowed))
                .await?
            {
                migrated += 1;
            }
        }
        Ok(migrated)
    }

    /// Give every rule without permission rows a default role set. Inserted
    /// rows carry `allowed = null`.
    pub async fn assign_defaults(&self, strategy: &AssignStrategy) -> RbacResult<AssignReport> {
        let roles = self.roles.snapshot();
        let role_ids = roles.ids();
        let mut report = AssignReport::default();

        let rules = self.store.list_rules(&self.service).await?;
        let with_rows: HashSet<RuleId> = self
            .store
            .list_permissions(&self.service)
            .await?
            .into_iter()
            .map(|p| p.rule_id)
            .collect();
        let bare: Vec<&Rule> = rules.iter().filter(|r| !with_rows.contains(&r.id)).collect();
        report.rules_without_permissions = bare.len();

        let Some(first_role) = role_ids.first().copied() else {
            warn!("No roles loaded; default assignment skipped");
            return Ok(report);
        };
        let fallback = roles.highest().unwrap_or(first_role);

        for rule in bare {
            let targets: Vec<RoleId> = match strategy {
                AssignStrategy::ByPolicy => match rule.access_policy {
                    AccessPolicy::AllowAll => role_ids.clone(),
                    AccessPolicy::Protected | AccessPolicy::ForbidAll => vec![fallback],
                },
                AssignStrategy::AllRoles => role_ids.clone(),
                AssignStrategy::Specific(ids) => ids
                    .iter()
                    .copied()
                    .filter(|id| {
                        let known = roles.contains(*id);
                        if !known {
                            warn!(role_id = %id, "Unknown role in default assignment; skipped");
                        }
                        known
                    })
                    .collect(),
            };
            if targets.is_empty() {
                continue;
            }
            for role in targets {
                if self
                    .store
                    .insert_permission(&RulePermission::new(rule.id, role, None))
                    .await?
                {
                    report.permissions_created += 1;
                }
            }
            report.rules_assigned += 1;
        }

        info!(
            service = %self.service,
            strategy = ?strategy,
            rules_assigned = report.rules_assigned,
            permissions_created = report.permissions_created,
            "Default permissions assigned"
        );
        Ok(report)
    }

    /// Compare persisted rules with each other and with the declared routes.
    pub async fn consistency_report(&self) -> RbacResult<ConsistencyReport> {
        let rules = self.store.list_rules(&self.service).await?;
        let permissions = self.store.list_permissions(&self.service).await?;
        let orphans = self.store.orphaned_permissions().await?;
        let fresh = self.registry.fresh_routes();

        let with_rows: HashSet<RuleId> = permissions.iter().map(|p| p.rule_id).collect();
        let mut rules_without_permissions: Vec<RouteKey> = rules
            .iter()
            .filter(|r| !with_rows.contains(&r.id))
            .map(Rule::key)
            .collect();
        rules_without_permissions.sort();

        let persisted: HashSet<RouteKey> = rules.iter().map(Rule::key).collect();
        let unpersisted_routes: Vec<RouteKey> = fresh
            .iter()
            .filter(|d| !persisted.contains(&d.key))
            .map(|d| d.key.clone())
            .collect();
        let mut undeclared_rules: Vec<RouteKey> = if fresh.is_empty() {
            Vec::new()
        } else {
            let declared: HashSet<&RouteKey> = fresh.iter().map(|d| &d.key).collect();
            persisted.iter().filter(|k| !declared.contains(k)).cloned().collect()
        };
        undeclared_rules.sort();

        let is_healthy = rules_without_permissions.is_empty()
            && orphans.is_empty()
            && unpersisted_routes.is_empty()
            && undeclared_rules.is_empty();

        Ok(ConsistencyReport {
            service: self.service.to_string(),
            total_rules: rules.len(),
            total_permissions: permissions.len(),
            rules_without_permissions,
            orphaned_permissions: orphans.len(),
            unpersisted_routes,
            undeclared_rules,
            is_healthy,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

/// Pick the obsolete rule a new route most likely moved from: same method,
/// most leading path segments in common, then lowest id. Each rule is handed
/// out once per pass.
fn take_candidate<'a>(candidates: &mut BTreeMap<String, Vec<&'a Rule>>, key: &RouteKey) -> Option<&'a Rule> {
    let rules = candidates.get_mut(&key.method)?;
    let (index, _) = rules
        .iter()
        .enumerate()
        .map(|(i, rule)| (i, shared_segments(&rule.path, &key.path)))
        .fold(None, |best: Option<(usize, usize)>, (i, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((i, score)),
        })?;
    Some(rules.remove(index))
}

fn shared_segments(a: &str, b: &str) -> usize {
    a.split('/')
        .zip(b.split('/'))
        .filter(|(x, _)| !x.is_empty())
        .take_while(|(x, y)| x == y)
        .count()
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("service", &self.service)
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
    use crate::rbac::declare::RoleExpr;
    use crate::rbac::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: RuleRegistry,
        roles: RoleStore,
        engine: ReconciliationEngine,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::with_roles(["admin", "editor", "viewer"]));
        let registry = RuleRegistry::new();
        let roles = RoleStore::new("admin");
        roles.load(store.as_ref()).await.unwrap();
        let engine = ReconciliationEngine::new(store.clone(), registry.clone(), roles.clone(), "svc");
        Fixture {
            store,
            registry,
            roles,
            engine,
        }
    }

    impl Fixture {
        fn declare(&self, method: &str, path: &str, is_private: bool, expr: RoleExpr) {
            self.registry.declare(DeclaredRoute::new(
                RouteKey::new(method, path),
                is_private,
                expr,
                &self.roles.snapshot(),
            ));
        }

        async fn rule(&self, method: &str, path: &str) -> Option<Rule> {
            self.store.find_rule("svc", &RouteKey::new(method, path)).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_creates_rules_and_seeds_declared_permissions() {
        let fx = fixture().await;
        fx.declare("GET", "/api/rules", true, RoleExpr::allow([2]));
        fx.declare("GET", "/api/health", false, RoleExpr::AllowAll);

        let report = fx.engine.synchronize().await.unwrap();
        assert_eq!(report.created, 2);
        assert!(report.is_complete());

        let rule = fx.rule("GET", "/api/rules").await.unwrap();
        assert_eq!(rule.access_policy, AccessPolicy::Protected);
        let perms = fx.store.rule_permissions(rule.id).await.unwrap();
        assert_eq!(perms, vec![RulePermission::new(rule.id, RoleId(2), Some(true))]);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let fx = fixture().await;
        fx.declare("GET", "/api/rules", true, RoleExpr::allow([2]));
        fx.declare("POST", "/api/rules", true, RoleExpr::ForbidAll);

        for _ in 0..3 {
            fx.engine.synchronize().await.unwrap();
        }
        assert_eq!(fx.store.rule_count(), 2);
        let report = fx.engine.synchronize().await.unwrap();
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.created, 0);
    }

    #[tokio::test]
    async fn test_existing_rule_keeps_operator_policy() {
        let fx = fixture().await;
        fx.declare("GET", "/api/rules", true, RoleExpr::allow([2]));
        fx.engine.synchronize().await.unwrap();

        let rule = fx.rule("GET", "/api/rules").await.unwrap();
        fx.store.set_rule_policy(rule.id, AccessPolicy::ForbidAll).await.unwrap();

        fx.registry.clear_fresh();
        fx.declare("GET", "/api/rules", false, RoleExpr::AllowAll);
        let report = fx.engine.synchronize().await.unwrap();
        assert_eq!(report.updated, 1);

        let rule = fx.rule("GET", "/api/rules").await.unwrap();
        assert_eq!(rule.access_policy, AccessPolicy::ForbidAll);
        assert!(!rule.is_private);
    }

    #[tokio::test]
    async fn test_path_change_migrates_permissions() {
        let fx = fixture().await;
        fx.declare("GET", "/api/v1/reports", true, RoleExpr::protected());
        fx.engine.synchronize().await.unwrap();
        let old = fx.rule("GET", "/api/v1/reports").await.unwrap();
        fx.store
            .upsert_permission(&RulePermission::new(old.id, RoleId(2), Some(true)))
            .await
            .unwrap();
        fx.store
            .upsert_permission(&RulePermission::new(old.id, RoleId(3), Some(false)))
            .await
            .unwrap();

        fx.registry.clear_fresh();
        fx.declare("GET", "/api/v2/reports", true, RoleExpr::protected());
        let report = fx.engine.synchronize().await.unwrap();
        assert_eq!(report.moved, 1);
        assert_eq!(report.permissions_migrated, 2);
        assert_eq!(report.obsolete_deleted, 1);

        assert!(fx.rule("GET", "/api/v1/reports").await.is_none());
        let new = fx.rule("GET", "/api/v2/reports").await.unwrap();
        let mut perms: Vec<_> = fx
            .store
            .rule_permissions(new.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.role_id, p.allowed))
            .collect();
        perms.sort();
        assert_eq!(perms, vec![(RoleId(2), Some(true)), (RoleId(3), Some(false))]);
    }

    #[tokio::test]
    async fn test_move_prefers_closest_path() {
        let fx = fixture().await;
        fx.declare("GET", "/api/users/list", true, RoleExpr::protected());
        fx.declare("GET", "/api/rules/list", true, RoleExpr::protected());
        fx.engine.synchronize().await.unwrap();
        let rules_old = fx.rule("GET", "/api/rules/list").await.unwrap();
        fx.store
            .upsert_permission(&RulePermission::new(rules_old.id, RoleId(3), Some(true)))
            .await
            .unwrap();

        fx.registry.clear_fresh();
        fx.declare("GET", "/api/users/all", true, RoleExpr::protected());
        fx.declare("GET", "/api/rules/all", true, RoleExpr::protected());
        let report = fx.engine.synchronize().await.unwrap();
        assert_eq!(report.moved, 2);

        let moved = fx.rule("GET", "/api/rules/all").await.unwrap();
        let perms = fx.store.rule_permissions(moved.id).await.unwrap();
        assert_eq!(perms, vec![RulePermission::new(moved.id, RoleId(3), Some(true))]);
        let users = fx.rule("GET", "/api/users/all").await.unwrap();
        assert!(fx.store.rule_permissions(users.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_obsolete_rules_are_swept() {
        let fx = fixture().await;
        fx.declare("GET", "/api/a", true, RoleExpr::allow([2]));
        fx.declare("DELETE", "/api/b", true, RoleExpr::allow([2]));
        fx.engine.synchronize().await.unwrap();
        let a = fx.rule("GET", "/api/a").await.unwrap();

        fx.registry.clear_fresh();
        fx.declare("GET", "/api/a", true, RoleExpr::allow([2]));
        let report = fx.engine.synchronize().await.unwrap();
        assert_eq!(report.obsolete_deleted, 1);
        assert!(fx.rule("DELETE", "/api/b").await.is_none());
        assert_eq!(fx.rule("GET", "/api/a").await.unwrap(), a);
        assert_eq!(fx.store.permission_count(), 1);
    }

    #[tokio::test]
    async fn test_route_failure_does_not_abort_pass() {
        let fx = fixture().await;
        fx.store.fail_inserts_for("/api/broken");
        fx.declare("GET", "/api/broken", true, RoleExpr::AllowAll);
        fx.declare("GET", "/api/fine", true, RoleExpr::AllowAll);

        let report = fx.engine.synchronize().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].route, RouteKey::new("GET", "/api/broken"));
        assert!(matches!(
            report.ensure_complete(),
            Err(RbacError::ReconciliationPartialFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_move_keeps_old_rule() {
        let fx = fixture().await;
        fx.declare("GET", "/api/old", true, RoleExpr::allow([2]));
        fx.engine.synchronize().await.unwrap();

        fx.registry.clear_fresh();
        fx.store.fail_inserts_for("/api/new");
        fx.declare("GET", "/api/new", true, RoleExpr::allow([2]));
        let report = fx.engine.synchronize().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.obsolete_deleted, 0);
        assert!(fx.rule("GET", "/api/old").await.is_some());
    }

    #[tokio::test]
    async fn test_empty_fresh_set_skips_pass() {
        let fx = fixture().await;
        fx.declare("GET", "/api/a", true, RoleExpr::AllowAll);
        fx.engine.synchronize().await.unwrap();

        fx.registry.clear_fresh();
        let report = fx.engine.synchronize().await.unwrap();
        assert!(report.skipped);
        assert_eq!(fx.store.rule_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_fresh_set_still_sweeps_orphans() {
        let fx = fixture().await;
        fx.store.insert_raw_permission(RulePermission::new(RuleId(99), RoleId(1), Some(true)));

        let report = fx.engine.synchronize().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.orphans_deleted, 1);
        assert_eq!(fx.store.permission_count(), 0);
    }

    #[tokio::test]
    async fn test_orphans_are_swept() {
        let fx = fixture().await;
        fx.declare("GET", "/api/a", true, RoleExpr::AllowAll);
        fx.store.insert_raw_permission(RulePermission::new(RuleId(99), RoleId(1), Some(true)));

        let report = fx.engine.synchronize().await.unwrap();
        assert_eq!(report.orphans_deleted, 1);
    }

    #[tokio::test]
    async fn test_storage_down_aborts_pass() {
        let fx = fixture().await;
        fx.declare("GET", "/api/a", true, RoleExpr::AllowAll);
        fx.store.set_unavailable(true);
        assert!(fx.engine.synchronize().await.unwrap_err().is_storage());
    }

    #[tokio::test]
    async fn test_assign_defaults_by_policy() {
        let fx = fixture().await;
        for (method, policy) in [
            ("GET", AccessPolicy::AllowAll),
            ("POST", AccessPolicy::Protected),
            ("DELETE", AccessPolicy::ForbidAll),
        ] {
            fx.store
                .insert_rule(&NewRule {
                    method: method.into(),
                    path: "/api/x".into(),
                    service: "svc".into(),
                    is_private: true,
                    access_policy: policy,
                })
                .await
                .unwrap();
        }

        let report = fx.engine.assign_defaults(&AssignStrategy::ByPolicy).await.unwrap();
        assert_eq!(report.rules_assigned, 3);
        assert_eq!(report.permissions_created, 3 + 1 + 1);

        let post = fx.rule("POST", "/api/x").await.unwrap();
        assert_eq!(
            fx.store.rule_permissions(post.id).await.unwrap(),
            vec![RulePermission::new(post.id, RoleId(1), None)]
        );

        let again = fx.engine.assign_defaults(&AssignStrategy::AllRoles).await.unwrap();
        assert_eq!(again.rules_assigned, 0);
    }

    #[tokio::test]
    async fn test_assign_defaults_falls_back_to_first_role() {
        let store = Arc::new(MemoryStore::with_roles(["editor", "viewer"]));
        let roles = RoleStore::new("admin");
        roles.load(store.as_ref()).await.unwrap();
        let engine = ReconciliationEngine::new(store.clone(), RuleRegistry::new(), roles, "svc");
        let rule = store
            .insert_rule(&NewRule {
                method: "GET".into(),
                path: "/api/x".into(),
                service: "svc".into(),
                is_private: true,
                access_policy: AccessPolicy::Protected,
            })
            .await
            .unwrap()
            .into_rule();

        engine.assign_defaults(&AssignStrategy::ByPolicy).await.unwrap();
        assert_eq!(
            store.rule_permissions(rule.id).await.unwrap(),
            vec![RulePermission::new(rule.id, RoleId(1), None)]
        );
    }

    #[tokio::test]
    async fn test_assign_defaults_specific_skips_unknown_roles() {
        let fx = fixture().await;
        fx.declare("GET", "/api/x", true, RoleExpr::protected());
        fx.engine.synchronize().await.unwrap();

        let report = fx
            .engine
            .assign_defaults(&AssignStrategy::Specific(vec![RoleId(3), RoleId(42)]))
            .await
            .unwrap();
        assert_eq!(report.permissions_created, 1);
    }

    #[tokio::test]
    async fn test_consistency_report() {
        let fx = fixture().await;
        fx.declare("GET", "/api/a", true, RoleExpr::protected());
        fx.engine.synchronize().await.unwrap();
        fx.declare("GET", "/api/b", true, RoleExpr::protected());

        let report = fx.engine.consistency_report().await.unwrap();
        assert_eq!(report.total_rules, 1);
        assert_eq!(report.rules_without_permissions, vec![RouteKey::new("GET", "/api/a")]);
        assert_eq!(report.unpersisted_routes, vec![RouteKey::new("GET", "/api/b")]);
        assert!(!report.is_healthy);

        fx.engine.synchronize().await.unwrap();
        fx.engine.assign_defaults(&AssignStrategy::ByPolicy).await.unwrap();
        assert!(fx.engine.consistency_report().await.unwrap().is_healthy);
    }

    #[test]
    fn test_shared_segments() {
        assert_eq!(shared_segments("/api/rules/list", "/api/rules/all"), 2);
        assert_eq!(shared_segments("/api/users", "/api/rules"), 1);
        assert_eq!(shared_segments("/x", "/y"), 0);
    }
}

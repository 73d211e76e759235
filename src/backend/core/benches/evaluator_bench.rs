//! Benchmarks for request-time permission evaluation.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;
use std::sync::Arc;

use lingua_core::config::RbacConfig;
use lingua_core::rbac::{
    decide, AccessPolicy, Caller, MemoryStore, Rbac, RoleExpr, RoleId, RouteKey, RouteSnapshot, RuleId, Visibility,
};

fn protected_route(overrides: usize) -> RouteSnapshot {
    let roles: BTreeMap<RoleId, Option<bool>> = (1..=overrides as i32).map(|id| (RoleId(id), Some(id % 7 != 0))).collect();
    RouteSnapshot {
        key: RouteKey::new("GET", "/api/items/:id"),
        rule_id: Some(RuleId(1)),
        is_private: true,
        access_policy: AccessPolicy::Protected,
        roles,
    }
}

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("decide");
    for overrides in [1usize, 8, 64] {
        let route = protected_route(overrides);
        let caller = Caller::authenticated("bench-user", [RoleId(overrides as i32 + 1), RoleId(2)]);
        group.bench_with_input(BenchmarkId::from_parameter(overrides), &route, |b, r| { b.iter(|| black_box(decide(r, &caller))); });
    }
    group.finish();
}

fn bench_decide_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("decide_policies");
    let caller = Caller::authenticated("bench-user", [RoleId(3)]);
    for policy in [AccessPolicy::AllowAll, AccessPolicy::Protected, AccessPolicy::ForbidAll] {
        let route = RouteSnapshot { access_policy: policy, ..protected_route(8) };
        group.bench_with_input(BenchmarkId::from_parameter(policy), &route, |b, r| { b.iter(|| black_box(decide(r, &caller))); });
    }
    group.finish();
}

fn bench_evaluate_registry(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let rbac = rt.block_on(async {
        let store = Arc::new(MemoryStore::with_roles(["admin", "editor", "viewer"]));
        let rbac = Rbac::new(RbacConfig::default(), store).unwrap();
        rbac.init().await.unwrap();
        for i in 0..500 {
            rbac.declare("GET", &format!("/resources/{}/:id", i), Visibility::Private, RoleExpr::allow([2])).unwrap();
        }
        rbac.synchronize().await.unwrap();
        rbac
    });
    let evaluator = rbac.evaluator().clone();

    let mut group = c.benchmark_group("evaluate_registry");
    group.throughput(Throughput::Elements(1));
    for (label, caller) in [
        ("admin", Caller::authenticated("root", [RoleId(1)])),
        ("granted", Caller::authenticated("alice", [RoleId(2)])),
        ("denied", Caller::authenticated("bob", [RoleId(3)])),
        ("anonymous", Caller::anonymous()),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(label), &caller, |b, caller| {
            b.to_async(&rt).iter(|| async { black_box(evaluator.evaluate("GET", "/api/resources/250/:id", caller).await.unwrap()) });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decide, bench_decide_policies, bench_evaluate_registry);
criterion_main!(benches);

//! Registry administration: routes, reload, sync, stats, consistency and
//! decision explanations.

use anyhow::Result;
use clap::{Args, ValueEnum};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Deserialize, Serialize)]
struct RouteKey {
    method: String,
    path: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct RouteSnapshot {
    key: RouteKey,
    rule_id: Option<i32>,
    is_private: bool,
    access_policy: String,
    #[serde(default)]
    roles: BTreeMap<String, Option<bool>>,
}

#[derive(Debug, Serialize, Tabled)]
struct RouteRow {
    #[tabled(rename = "Rule")]
    rule_id: String,
    #[tabled(rename = "Method")]
    method: String,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Private")]
    private: bool,
    #[tabled(rename = "Policy")]
    policy: String,
    #[tabled(rename = "Overrides")]
    overrides: String,
}

impl From<RouteSnapshot> for RouteRow {
    fn from(route: RouteSnapshot) -> Self {
        let overrides = route
            .roles
            .iter()
            .filter_map(|(role, allowed)| allowed.map(|a| format!("{}{}", if a { "+" } else { "-" }, role)))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            rule_id: route.rule_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            method: route.key.method,
            path: route.key.path,
            private: route.is_private,
            policy: route.access_policy,
            overrides,
        }
    }
}

#[derive(Args)]
pub struct SyncArgs {
    /// How roles are picked for rules left without permissions
    #[arg(short, long, value_enum, default_value = "by-policy")]
    defaults: Strategy,

    /// Role ids for `--defaults specific`
    #[arg(long = "role-id", value_delimiter = ',')]
    role_ids: Vec<i32>,

    /// Server-side deadline in seconds
    #[arg(short, long)]
    timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Strategy {
    ByPolicy,
    AllRoles,
    Specific,
}

impl SyncArgs {
    fn body(&self) -> Result<serde_json::Value> {
        let defaults = match self.defaults {
            Strategy::ByPolicy => serde_json::json!({ "strategy": "by_policy" }),
            Strategy::AllRoles => serde_json::json!({ "strategy": "all_roles" }),
            Strategy::Specific => {
                if self.role_ids.is_empty() {
                    anyhow::bail!("--defaults specific requires at least one --role-id");
                }
                serde_json::json!({ "strategy": "specific", "role_ids": self.role_ids })
            }
        };
        Ok(serde_json::json!({ "defaults": defaults, "timeout_secs": self.timeout }))
    }
}

#[derive(Args)]
pub struct ExplainArgs {
    /// User id (anonymous when omitted)
    #[arg(short, long)]
    user: Option<String>,

    #[arg(short, long, default_value = "GET")]
    method: String,

    /// Route template, e.g. /api/rbac/rules/:rule_id/policy
    path: String,
}

pub async fn routes(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let routes: Vec<RouteSnapshot> = client.get("/api/rbac/routes").await?;
    match format {
        OutputFormat::Table => {
            let rows: Vec<RouteRow> = routes.into_iter().map(RouteRow::from).collect();
            output::print_list(&rows, format)
        }
        _ => output::print_item(&routes, format),
    }
}

pub async fn reload(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: serde_json::Value = client.post("/api/rbac/reload", &serde_json::json!({})).await?;
    match format {
        OutputFormat::Table => {
            output::print_success(&format!(
                "Reloaded {} role(s) and {} rule(s)",
                report["roles"],
                report["registry"]["persisted"]
            ));
            Ok(())
        }
        _ => output::print_item(&report, format),
    }
}

pub async fn sync(args: SyncArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: serde_json::Value = client.post("/api/rbac/sync", &args.body()?).await?;
    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&report, format);
    }

    let sync = &report["sync"];
    output::print_header("Synchronization");
    for (label, key) in [
        ("Declared routes", "fresh_routes"),
        ("Created", "created"),
        ("Moved", "moved"),
        ("Updated", "updated"),
        ("Unchanged", "unchanged"),
        ("Obsolete deleted", "obsolete_deleted"),
        ("Orphans deleted", "orphans_deleted"),
    ] {
        output::print_detail(label, &sync[key]);
    }
    output::print_detail("Permissions created", &report["defaults"]["permissions_created"]);
    println!();

    let failures = sync["failures"].as_array().map(Vec::len).unwrap_or(0)
        + sync["sweep_errors"].as_array().map(Vec::len).unwrap_or(0);
    if sync["skipped"].as_bool().unwrap_or(false) {
        output::print_warning("Server declared no routes; only orphaned permissions were swept");
    } else if failures == 0 {
        output::print_success("Rules match the declared routes");
    } else {
        for failure in sync["failures"].as_array().into_iter().flatten() {
            output::print_error(&format!(
                "{} {}: {}",
                failure["route"]["method"].as_str().unwrap_or("?"),
                failure["route"]["path"].as_str().unwrap_or("?"),
                failure["reason"].as_str().unwrap_or("?")
            ));
        }
        anyhow::bail!("synchronization finished with {} failure(s)", failures);
    }
    Ok(())
}

pub async fn stats(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let stats: serde_json::Value = client.get("/api/rbac/stats").await?;
    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&stats, format);
    }

    let rbac = &stats["rbac"];
    output::print_header("RBAC");
    output::print_detail("Service", rbac["service"].as_str().unwrap_or("?"));
    output::print_detail("Highest role", rbac["highest_role"].as_str().unwrap_or("?"));
    output::print_detail("Roles", &rbac["roles"]);
    output::print_detail("Committed routes", &rbac["committed_routes"]);
    output::print_detail("Public routes", &rbac["public_routes"]);
    output::print_detail("Declared routes", &rbac["fresh_routes"]);
    output::print_detail("Store", rbac["store"].as_str().unwrap_or("?"));

    if let Some(pool) = stats["pool"].as_object() {
        output::print_header("Database pool");
        for (key, value) in pool {
            output::print_detail(key, value);
        }
    }
    Ok(())
}

pub async fn consistency(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: serde_json::Value = client.get("/api/rbac/consistency").await?;
    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&report, format);
    }

    output::print_header("Consistency");
    output::print_detail("Rules", &report["total_rules"]);
    output::print_detail("Permissions", &report["total_permissions"]);
    output::print_detail("Orphaned permissions", &report["orphaned_permissions"]);
    for (title, key) in [
        ("Rules without permissions", "rules_without_permissions"),
        ("Declared but not persisted", "unpersisted_routes"),
        ("Persisted but not declared", "undeclared_rules"),
    ] {
        let keys = report[key].as_array().cloned().unwrap_or_default();
        if keys.is_empty() {
            continue;
        }
        println!();
        println!("  {}", title.yellow());
        for k in keys {
            println!(
                "    {} {}",
                k["method"].as_str().unwrap_or("?"),
                k["path"].as_str().unwrap_or("?")
            );
        }
    }
    println!();

    if report["is_healthy"].as_bool().unwrap_or(false) {
        output::print_success("Rule tables are consistent");
        Ok(())
    } else {
        anyhow::bail!("rule tables need attention; run `lingua sync`")
    }
}

pub async fn explain(args: ExplainArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let mut query = vec![("method", args.method), ("path", args.path)];
    if let Some(user) = args.user {
        query.push(("user_id", user));
    }
    let explanation: serde_json::Value = client.get_query("/api/rbac/explain", &query).await?;
    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&explanation, format);
    }

    let decision = &explanation["decision"];
    let allowed = decision["outcome"] == "allow";
    let verdict = if allowed { "ALLOW".green().bold() } else { "DENY".red().bold() };
    let roles: Vec<&str> = explanation["role_names"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .collect();

    output::print_header("Decision");
    output::print_detail(
        "Route",
        format!(
            "{} {}",
            explanation["route"]["method"].as_str().unwrap_or("?"),
            explanation["route"]["path"].as_str().unwrap_or("?")
        ),
    );
    output::print_detail("Caller", explanation["caller"]["user_id"].as_str().unwrap_or("anonymous"));
    output::print_detail("Roles", roles.join(", "));
    output::print_detail(
        "Decision",
        format!("{} ({})", verdict, decision["reason"].as_str().unwrap_or("?")),
    );
    output::print_detail("Rule source", explanation["source"].as_str().unwrap_or("?"));
    Ok(())
}

pub async fn whoami(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let me: serde_json::Value = client.get("/api/rbac/me").await?;
    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&me, format);
    }

    output::print_header("Caller");
    output::print_detail("User", me["user_id"].as_str().unwrap_or("anonymous"));
    for role in me["roles"].as_array().into_iter().flatten() {
        output::print_detail(
            "Role",
            format!("{} ({})", role["name"].as_str().unwrap_or("?"), role["id"]),
        );
    }
    Ok(())
}

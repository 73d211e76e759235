//! Lingua Admin - operator commands for the RBAC tables
//!
//! Talks to PostgreSQL directly, using the same configuration as the server.
//!
//! Usage:
//!   lingua-admin migrate run
//!   lingua-admin seed-roles --role editor --role viewer
//!   lingua-admin bootstrap-admin <user-id>
//!   lingua-admin sync --defaults by-policy
//!   lingua-admin check
//!   lingua-admin explain --user alice --method DELETE --path /api/rbac/roles

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use lingua_core::{
    api,
    config::Config,
    db::Database,
    rbac::{AssignStrategy, PgStore, Rbac, RoleId, UserId},
    telemetry::{init_logging, LogFormat, LoggingConfig},
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Definition
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(name = "lingua-admin")]
#[command(author, version, about = "Lingua RBAC administration", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    format: OutputFormat,

    /// Config file (defaults to LINGUA_CONFIG or config/default)
    #[arg(short, long, global = true, env = "LINGUA_CONFIG")]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database migrations
    #[command(subcommand)]
    Migrate(MigrateCommands),

    /// Create roles that do not exist yet
    SeedRoles {
        /// Role names (defaults to rbac.default_roles)
        #[arg(short, long = "role")]
        roles: Vec<String>,
    },

    /// Ensure the highest-privilege role exists and assign it to a user
    BootstrapAdmin {
        user_id: String,
    },

    /// Reconcile persisted rules with the declared API routes
    Sync(SyncArgs),

    /// Give rules without permission rows a default set of roles
    AssignDefaults(DefaultsArgs),

    /// Report consistency of the rule tables
    Check,

    /// List committed routes
    Routes,

    /// Explain the decision for a request
    Explain {
        /// User id (anonymous when omitted)
        #[arg(short, long)]
        user: Option<String>,

        #[arg(short, long, default_value = "GET")]
        method: String,

        #[arg(short, long)]
        path: String,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Apply pending migrations
    Run,

    /// Show applied and pending migrations
    Status {
        /// Show only pending migrations
        #[arg(short, long)]
        pending: bool,
    },
}

#[derive(Args)]
struct SyncArgs {
    #[command(flatten)]
    defaults: DefaultsArgs,

    /// Skip default assignment after reconciling
    #[arg(long)]
    no_defaults: bool,

    /// Deadline for the whole run in seconds (defaults to rbac.sync_timeout)
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,
}

#[derive(Args)]
struct DefaultsArgs {
    /// How roles are picked for rules without permissions
    #[arg(short, long = "defaults", value_enum, default_value = "by-policy")]
    strategy: StrategyArg,

    /// Role ids for `--defaults specific`
    #[arg(long = "role-id", value_delimiter = ',')]
    role_ids: Vec<i32>,
}

impl DefaultsArgs {
    fn strategy(&self) -> Result<AssignStrategy> {
        Ok(match self.strategy {
            StrategyArg::ByPolicy => AssignStrategy::ByPolicy,
            StrategyArg::AllRoles => AssignStrategy::AllRoles,
            StrategyArg::Specific => {
                if self.role_ids.is_empty() {
                    bail!("--defaults specific requires at least one --role-id");
                }
                AssignStrategy::Specific(self.role_ids.iter().copied().map(RoleId).collect())
            }
        })
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    ByPolicy,
    AllRoles,
    Specific,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    #[default]
    Table,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Display Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Tabled, Serialize)]
struct MigrationRow {
    #[tabled(rename = "Migration")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled, Serialize)]
struct RoleRow {
    #[tabled(rename = "ID")]
    id: i32,
    #[tabled(rename = "Name")]
    name: String,
}

#[derive(Tabled, Serialize)]
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

#[derive(Tabled, Serialize)]
struct FailureRow {
    #[tabled(rename = "Route")]
    route: String,
    #[tabled(rename = "Error")]
    error: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    fn print_success(&self, message: &str) {
        if !self.is_json() {
            println!("{} {}", "[OK]".green().bold(), message);
        }
    }

    fn print_error(&self, message: &str) {
        if self.is_json() {
            eprintln!("{}", serde_json::json!({ "status": "error", "message": message }));
        } else {
            eprintln!("{} {}", "[ERROR]".red().bold(), message);
        }
    }

    fn print_warning(&self, message: &str) {
        if !self.is_json() {
            println!("{} {}", "[WARN]".yellow().bold(), message);
        }
    }

    fn print_info(&self, message: &str) {
        if !self.is_json() {
            println!("{} {}", "[INFO]".blue().bold(), message);
        }
    }

    fn print_table<T: Tabled + Serialize>(&self, items: &[T]) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(&items),
            OutputFormat::Text | OutputFormat::Table => {
                if items.is_empty() {
                    println!("{}", "No results found.".dimmed());
                    return Ok(());
                }
                let mut table = Table::new(items);
                match self.format {
                    OutputFormat::Text => table.with(Style::blank()),
                    _ => table.with(Style::rounded()),
                };
                table.with(Modify::new(Columns::first()).with(Alignment::left()));
                println!("{}", table);
                Ok(())
            }
        }
    }

    fn print_json<T: Serialize>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        println!("{}", json);
        Ok(())
    }

    fn print_header(&self, title: &str) {
        if !self.is_json() {
            println!();
            println!("{}", title.bold().underline());
            println!();
        }
    }

    fn print_key_value(&self, key: &str, value: impl std::fmt::Display) {
        if !self.is_json() {
            println!("  {}: {}", key.cyan(), value);
        }
    }
}

fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

// ═══════════════════════════════════════════════════════════════════════════════
// Setup
// ═══════════════════════════════════════════════════════════════════════════════

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path).with_context(|| format!("loading config from {}", path)),
        None => Config::load().context("loading config"),
    }
}

async fn connect(config: &Config) -> Result<Database> {
    Database::new(&config.database)
        .await
        .context("connecting to the database")
}

/// Load roles and rules, then declare the API routes so the fresh set
/// matches what the server would mount.
async fn open_rbac(config: &Config, db: &Database) -> Result<Rbac> {
    let rbac = Rbac::new(config.rbac.clone(), Arc::new(PgStore::new(db.pool().clone())))?;
    rbac.init().await?;
    let _ = api::declare_routes(&rbac);
    Ok(rbac)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn handle_migrate_command(cmd: MigrateCommands, db: &Database, output: &OutputHelper) -> Result<()> {
    match cmd {
        MigrateCommands::Run => {
            output.print_header("Database Migrations");
            let spinner = create_spinner("Running migrations...");
            let result = db.migrate().await;
            spinner.finish_and_clear();
            result?;

            let status = db.migration_status().await?;
            if output.is_json() {
                output.print_json(&status)?;
            }
            output.print_success(&format!("{} migration(s) applied", status.applied.len()));
        }

        MigrateCommands::Status { pending } => {
            output.print_header("Migration Status");
            let status = db.migration_status().await?;

            let mut rows: Vec<MigrationRow> = Vec::new();
            if !pending {
                rows.extend(status.applied.iter().map(|name| MigrationRow {
                    name: name.clone(),
                    status: "Applied".green().to_string(),
                }));
            }
            rows.extend(status.pending.iter().map(|name| MigrationRow {
                name: name.clone(),
                status: "Pending".yellow().to_string(),
            }));
            output.print_table(&rows)?;

            if !status.is_current() {
                output.print_warning(&format!(
                    "{} pending migration(s); run `lingua-admin migrate run`",
                    status.pending.len()
                ));
            }
        }
    }

    Ok(())
}

async fn handle_seed_roles(roles: Vec<String>, config: &Config, rbac: &Rbac, output: &OutputHelper) -> Result<()> {
    let names = if roles.is_empty() {
        config.rbac.default_roles.clone()
    } else {
        roles
    };

    output.print_header("Seed Roles");
    let created = rbac.seed_roles(&names).await?;
    if created.is_empty() {
        output.print_info("All roles already exist");
    } else {
        output.print_success(&format!("Created {} role(s)", created.len()));
    }

    let rows: Vec<RoleRow> = rbac
        .list_roles()
        .into_iter()
        .map(|role| RoleRow {
            id: role.id.0,
            name: role.name,
        })
        .collect();
    output.print_table(&rows)
}

async fn handle_bootstrap_admin(user_id: String, rbac: &Rbac, output: &OutputHelper) -> Result<()> {
    let report = rbac.bootstrap_admin(&UserId::new(user_id)).await?;
    if output.is_json() {
        return output.print_json(&report);
    }

    if report.role_created {
        output.print_info(&format!("Created role '{}'", report.role.name));
    }
    if report.assigned {
        output.print_success(&format!("Assigned '{}' to {}", report.role.name, report.user_id));
    } else {
        output.print_info(&format!("{} already holds '{}'", report.user_id, report.role.name));
    }
    Ok(())
}

async fn handle_sync(args: SyncArgs, rbac: &Rbac, output: &OutputHelper) -> Result<()> {
    output.print_header("Route Synchronization");
    output.print_key_value("Service", &rbac.config().service);
    output.print_key_value("Declared routes", rbac.registry().fresh_count());

    let spinner = create_spinner("Reconciling rules...");
    let result = if args.no_defaults {
        rbac.synchronize().await.map(|sync| (sync, None))
    } else {
        let strategy = args.defaults.strategy()?;
        rbac.full_sync(&strategy, args.timeout.map(Duration::from_secs))
            .await
            .map(|report| (report.sync, Some(report.defaults)))
    };
    spinner.finish_and_clear();
    let (sync, defaults) = result?;

    if output.is_json() {
        return output.print_json(&serde_json::json!({ "sync": sync, "defaults": defaults }));
    }

    output.print_key_value("Created", sync.created);
    output.print_key_value("Moved", sync.moved);
    output.print_key_value("Updated", sync.updated);
    output.print_key_value("Unchanged", sync.unchanged);
    output.print_key_value("Obsolete deleted", sync.obsolete_deleted);
    output.print_key_value("Orphans deleted", sync.orphans_deleted);
    if let Some(defaults) = &defaults {
        output.print_key_value("Rules given defaults", defaults.rules_assigned);
        output.print_key_value("Permissions created", defaults.permissions_created);
    }
    println!();

    if sync.skipped {
        output.print_warning("No routes declared; only orphaned permissions were swept");
    } else if sync.is_complete() {
        output.print_success(&format!("Synchronized in {}ms", sync.duration_ms));
    } else {
        let rows: Vec<FailureRow> = sync
            .failures
            .iter()
            .map(|f| FailureRow {
                route: f.route.to_string(),
                error: f.reason.clone(),
            })
            .chain(sync.sweep_errors.iter().map(|e| FailureRow {
                route: "(sweep)".to_string(),
                error: e.clone(),
            }))
            .collect();
        output.print_table(&rows)?;
        bail!("synchronization finished with {} failure(s)", rows.len());
    }
    Ok(())
}

async fn handle_assign_defaults(args: DefaultsArgs, rbac: &Rbac, output: &OutputHelper) -> Result<()> {
    let strategy = args.strategy()?;
    let report = rbac.assign_defaults(&strategy).await?;
    if output.is_json() {
        return output.print_json(&report);
    }

    output.print_header("Default Permissions");
    output.print_key_value("Rules without permissions", report.rules_without_permissions);
    output.print_key_value("Rules assigned", report.rules_assigned);
    output.print_key_value("Permissions created", report.permissions_created);
    Ok(())
}

async fn handle_check(rbac: &Rbac, output: &OutputHelper) -> Result<()> {
    let report = rbac.consistency_report().await?;
    if output.is_json() {
        output.print_json(&report)?;
    } else {
        output.print_header("Consistency Check");
        output.print_key_value("Service", &report.service);
        output.print_key_value("Rules", report.total_rules);
        output.print_key_value("Permissions", report.total_permissions);
        output.print_key_value("Orphaned permissions", report.orphaned_permissions);

        let sections = [
            ("Rules without permissions", &report.rules_without_permissions),
            ("Declared but not persisted", &report.unpersisted_routes),
            ("Persisted but not declared", &report.undeclared_rules),
        ];
        for (title, keys) in sections {
            if keys.is_empty() {
                continue;
            }
            println!();
            println!("  {}", title.yellow());
            for key in keys {
                println!("    {}", key);
            }
        }
        println!();
    }

    if report.is_healthy {
        output.print_success("Rule tables are consistent");
        Ok(())
    } else {
        bail!("rule tables need attention; run `lingua-admin sync`")
    }
}

fn handle_routes(rbac: &Rbac, output: &OutputHelper) -> Result<()> {
    let roles = rbac.roles().snapshot();
    let rows: Vec<RouteRow> = rbac
        .routes()
        .into_iter()
        .map(|route| {
            let overrides = route
                .roles
                .iter()
                .filter_map(|(id, allowed)| {
                    let name = roles.name_of(*id).map(str::to_string).unwrap_or_else(|| id.to_string());
                    allowed.map(|a| format!("{}{}", if a { "+" } else { "-" }, name))
                })
                .collect::<Vec<_>>()
                .join(" ");
            RouteRow {
                rule_id: route.rule_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                method: route.key.method,
                path: route.key.path,
                private: route.is_private,
                policy: route.access_policy.to_string(),
                overrides,
            }
        })
        .collect();
    output.print_table(&rows)
}

async fn handle_explain(
    user: Option<String>,
    method: String,
    path: String,
    rbac: &Rbac,
    output: &OutputHelper,
) -> Result<()> {
    let user = user.map(UserId::new);
    let explanation = rbac.explain(user.as_ref(), &method, &path).await?;
    if output.is_json() {
        return output.print_json(&explanation);
    }

    let decision = &explanation.evaluation.decision;
    let verdict = if decision.is_allowed() {
        "ALLOW".green().bold()
    } else {
        "DENY".red().bold()
    };

    output.print_header("Decision");
    output.print_key_value("Route", &explanation.evaluation.route);
    output.print_key_value(
        "Caller",
        explanation
            .caller
            .user_id
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "anonymous".to_string()),
    );
    output.print_key_value("Roles", explanation.role_names.join(", "));
    output.print_key_value("Decision", format!("{} ({})", verdict, decision.reason_code()));
    output.print_key_value("Rule source", format!("{:?}", explanation.evaluation.source).to_lowercase());
    if let Some(rule) = &explanation.evaluation.rule {
        output.print_key_value("Policy", rule.access_policy);
        output.print_key_value("Private", rule.is_private);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

async fn run(cli: Cli, output: &OutputHelper) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    if cli.verbose {
        init_logging(&LoggingConfig::new("lingua_core=debug", LogFormat::Compact))?;
    }

    let db = connect(&config).await?;

    let result = match cli.command {
        Commands::Migrate(cmd) => handle_migrate_command(cmd, &db, output).await,
        command => run_rbac_command(command, &config, &db, output).await,
    };

    db.close().await;
    result
}

async fn run_rbac_command(command: Commands, config: &Config, db: &Database, output: &OutputHelper) -> Result<()> {
    db.startup_validation(config.database.auto_migrate).await?;
    let rbac = open_rbac(config, db).await?;

    match command {
        Commands::SeedRoles { roles } => handle_seed_roles(roles, config, &rbac, output).await,
        Commands::BootstrapAdmin { user_id } => handle_bootstrap_admin(user_id, &rbac, output).await,
        Commands::Sync(args) => handle_sync(args, &rbac, output).await,
        Commands::AssignDefaults(args) => handle_assign_defaults(args, &rbac, output).await,
        Commands::Check => handle_check(&rbac, output).await,
        Commands::Routes => handle_routes(&rbac, output),
        Commands::Explain { user, method, path } => handle_explain(user, method, path, &rbac, output).await,
        Commands::Migrate(cmd) => handle_migrate_command(cmd, db, output).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let output = OutputHelper::new(cli.format, cli.no_color);

    if let Err(e) = run(cli, &output).await {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

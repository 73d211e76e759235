//! Lingua CLI - command-line client for the Lingua RBAC administration API.
//!
//! Provides role, rule, override, user-role, registry and health commands.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, registry, roles, rules, users};
use output::OutputFormat;

/// Lingua - route-level access control administration
#[derive(Parser)]
#[command(
    name = "lingua",
    version,
    about = "Lingua RBAC administration client",
    long_about = "Manage roles, rules, per-role overrides and user assignments of a running Lingua server.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "LINGUA_API_URL")]
    api_url: Option<String>,

    /// Bearer token sent with every request
    #[arg(long, global = true, env = "LINGUA_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Role directory
    #[command(subcommand)]
    Roles(roles::RoleCommands),

    /// Rules and per-role overrides
    #[command(subcommand)]
    Rules(rules::RuleCommands),

    /// User role assignments
    #[command(subcommand)]
    Users(users::UserCommands),

    /// Committed route registry
    Routes,

    /// Reload roles and rules on the server
    Reload,

    /// Reconcile rules with the server's declared routes
    Sync(registry::SyncArgs),

    /// Registry counters
    Stats,

    /// Storage consistency report
    Check,

    /// Explain the decision for a request
    Explain(registry::ExplainArgs),

    /// Show the caller's roles
    Whoami,

    /// Check service health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(|| config::load_value("api-url"))
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let token = cli.token.clone().or_else(|| config::load_value("token"));

    let client = client::ApiClient::new(&api_url, token)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Roles(cmd) => roles::execute(cmd, &client, format).await,
        Commands::Rules(cmd) => rules::execute(cmd, &client, format).await,
        Commands::Users(cmd) => users::execute(cmd, &client, format).await,
        Commands::Routes => registry::routes(&client, format).await,
        Commands::Reload => registry::reload(&client, format).await,
        Commands::Sync(args) => registry::sync(args, &client, format).await,
        Commands::Stats => registry::stats(&client, format).await,
        Commands::Check => registry::consistency(&client, format).await,
        Commands::Explain(args) => registry::explain(args, &client, format).await,
        Commands::Whoami => registry::whoami(&client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

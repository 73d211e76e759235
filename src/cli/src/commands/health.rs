//! Health check command.
//!
//! Queries `/api/health` and reports service and database status.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include database details
    #[arg(short, long)]
    detailed: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (http_status, health) = client.get_raw("/api/health").await?;

    if !matches!(format, OutputFormat::Table) {
        output::print_item(&health, format)?;
    } else {
        let status = health.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");

        output::print_header("Service Health");
        output::print_detail("Status", status);
        output::print_detail("API URL", client.base_url());
        if let Some(service) = health.get("service").and_then(|v| v.as_str()) {
            output::print_detail("Service", service);
        }
        if let Some(version) = health.get("version").and_then(|v| v.as_str()) {
            output::print_detail("Version", version);
        }

        if args.detailed {
            if let Some(database) = health.get("database").and_then(|v| v.as_object()) {
                output::print_header("Database");
                for (key, value) in database {
                    output::print_detail(key, value);
                }
            }
        }
    }

    if http_status.is_success() {
        if matches!(format, OutputFormat::Table) {
            output::print_success("Service operational");
        }
        Ok(())
    } else {
        anyhow::bail!("service reported {}", http_status)
    }
}

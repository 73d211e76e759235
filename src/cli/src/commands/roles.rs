//! Role directory commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum RoleCommands {
    /// List roles
    List,

    /// Create a role (no-op if it already exists)
    Create {
        /// Role name; stored lowercased
        name: String,
    },
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Role {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize, Tabled)]
pub struct RoleRow {
    #[tabled(rename = "ID")]
    pub id: i32,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Description")]
    pub description: String,
}

impl From<Role> for RoleRow {
    fn from(role: Role) -> Self {
        Self {
            id: role.id,
            name: role.name,
            description: role.description,
        }
    }
}

pub async fn execute(cmd: RoleCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        RoleCommands::List => {
            let roles: Vec<Role> = client.get("/api/rbac/roles").await?;
            let rows: Vec<RoleRow> = roles.into_iter().map(RoleRow::from).collect();
            output::print_list(&rows, format)?;
        }

        RoleCommands::Create { name } => {
            let role: Role = client
                .post("/api/rbac/roles", &serde_json::json!({ "name": name }))
                .await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Role '{}' has id {}", role.name, role.id));
                }
                _ => output::print_item(&role, format)?,
            }
        }
    }

    Ok(())
}

//! User role assignment commands.

use anyhow::Result;
use clap::Subcommand;

use super::roles::{Role, RoleRow};
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum UserCommands {
    /// Show the roles a user holds
    Roles {
        user_id: String,
    },

    /// Give a user a role
    Assign {
        user_id: String,
        role_id: i32,
    },

    /// Take a role away from a user
    Revoke {
        user_id: String,
        role_id: i32,
    },
}

fn roles_path(user_id: &str) -> String {
    format!("/api/rbac/users/{}/roles", user_id)
}

pub async fn execute(cmd: UserCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        UserCommands::Roles { user_id } => {
            let roles: Vec<Role> = client.get(&roles_path(&user_id)).await?;
            let rows: Vec<RoleRow> = roles.into_iter().map(RoleRow::from).collect();
            output::print_list(&rows, format)?;
        }

        UserCommands::Assign { user_id, role_id } => {
            let resp: serde_json::Value = client
                .put(&format!("{}/{}", roles_path(&user_id), role_id), &serde_json::json!({}))
                .await?;
            match format {
                OutputFormat::Table => {
                    if resp["assigned"].as_bool().unwrap_or(false) {
                        output::print_success(&format!("Role {} assigned to {}", role_id, user_id));
                    } else {
                        output::print_info(&format!("{} already holds role {}", user_id, role_id));
                    }
                }
                _ => output::print_item(&resp, format)?,
            }
        }

        UserCommands::Revoke { user_id, role_id } => {
            let resp = client
                .delete(&format!("{}/{}", roles_path(&user_id), role_id))
                .await?
                .unwrap_or_default();
            match format {
                OutputFormat::Table => {
                    if resp["revoked"].as_bool().unwrap_or(false) {
                        output::print_success(&format!("Role {} revoked from {}", role_id, user_id));
                    } else {
                        output::print_info(&format!("{} did not hold role {}", user_id, role_id));
                    }
                }
                _ => output::print_item(&resp, format)?,
            }
        }
    }

    Ok(())
}

//! Rule and per-role override commands.

use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum RuleCommands {
    /// List persisted rules of the service
    List {
        /// Only rules whose path contains this text
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Set a rule's blanket access policy
    Policy {
        rule_id: i32,
        #[arg(value_enum)]
        policy: Policy,
    },

    /// Show a rule's per-role overrides
    Permissions {
        rule_id: i32,
    },

    /// Explicitly allow a role on a rule
    Grant {
        rule_id: i32,
        role_id: i32,
    },

    /// Explicitly deny a role on a rule
    Deny {
        rule_id: i32,
        role_id: i32,
    },

    /// Keep the override row but defer to the rule's policy
    Inherit {
        rule_id: i32,
        role_id: i32,
    },

    /// Remove the override row
    Clear {
        rule_id: i32,
        role_id: i32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    AllowAll,
    Protected,
    ForbidAll,
}

#[derive(Debug, Deserialize, Serialize)]
struct Rule {
    id: i32,
    method: String,
    path: String,
    is_private: bool,
    access_policy: String,
}

#[derive(Debug, Serialize, Tabled)]
struct RuleRow {
    #[tabled(rename = "ID")]
    id: i32,
    #[tabled(rename = "Method")]
    method: String,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Private")]
    private: bool,
    #[tabled(rename = "Policy")]
    policy: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct Permission {
    rule_id: i32,
    role_id: i32,
    allowed: Option<bool>,
}

#[derive(Debug, Serialize, Tabled)]
struct PermissionRow {
    #[tabled(rename = "Role")]
    role_id: i32,
    #[tabled(rename = "Override")]
    allowed: String,
}

fn describe(allowed: Option<bool>) -> &'static str {
    match allowed {
        Some(true) => "allow",
        Some(false) => "deny",
        None => "inherit",
    }
}

async fn set_override(
    client: &ApiClient,
    rule_id: i32,
    role_id: i32,
    allowed: Option<bool>,
    format: OutputFormat,
) -> Result<()> {
    let resp: serde_json::Value = client
        .put(
            &format!("/api/rbac/rules/{}/permissions/{}", rule_id, role_id),
            &serde_json::json!({ "allowed": allowed }),
        )
        .await?;
    match format {
        OutputFormat::Table => output::print_success(&format!(
            "Rule {} role {}: {}",
            rule_id,
            role_id,
            describe(allowed)
        )),
        _ => output::print_item(&resp, format)?,
    }
    Ok(())
}

pub async fn execute(cmd: RuleCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        RuleCommands::List { filter } => {
            let rules: Vec<Rule> = client.get("/api/rbac/rules").await?;
            let mut rows: Vec<RuleRow> = rules
                .into_iter()
                .filter(|r| filter.as_deref().map_or(true, |f| r.path.contains(f)))
                .map(|r| RuleRow {
                    id: r.id,
                    method: r.method,
                    path: r.path,
                    private: r.is_private,
                    policy: r.access_policy,
                })
                .collect();
            rows.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.method.cmp(&b.method)));
            output::print_list(&rows, format)?;
        }

        RuleCommands::Policy { rule_id, policy } => {
            let resp: serde_json::Value = client
                .put(
                    &format!("/api/rbac/rules/{}/policy", rule_id),
                    &serde_json::json!({ "policy": policy }),
                )
                .await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!(
                        "Rule {} policy set to {}",
                        rule_id,
                        resp["policy"].as_str().unwrap_or("?")
                    ))
                }
                _ => output::print_item(&resp, format)?,
            }
        }

        RuleCommands::Permissions { rule_id } => {
            let permissions: Vec<Permission> = client
                .get(&format!("/api/rbac/rules/{}/permissions", rule_id))
                .await?;
            match format {
                OutputFormat::Table => {
                    let rows: Vec<PermissionRow> = permissions
                        .into_iter()
                        .map(|p| PermissionRow {
                            role_id: p.role_id,
                            allowed: describe(p.allowed).to_string(),
                        })
                        .collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&permissions, format)?,
            }
        }

        RuleCommands::Grant { rule_id, role_id } => set_override(client, rule_id, role_id, Some(true), format).await?,
        RuleCommands::Deny { rule_id, role_id } => set_override(client, rule_id, role_id, Some(false), format).await?,
        RuleCommands::Inherit { rule_id, role_id } => set_override(client, rule_id, role_id, None, format).await?,

        RuleCommands::Clear { rule_id, role_id } => {
            client
                .delete(&format!("/api/rbac/rules/{}/permissions/{}", rule_id, role_id))
                .await?;
            output::print_success(&format!("Override for role {} removed from rule {}", role_id, rule_id));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_serializes_like_the_server() {
        assert_eq!(serde_json::to_value(Policy::ForbidAll).unwrap(), "forbid_all");
        assert_eq!(serde_json::to_value(Policy::AllowAll).unwrap(), "allow_all");
    }

    #[test]
    fn test_describe_override() {
        assert_eq!(describe(Some(true)), "allow");
        assert_eq!(describe(Some(false)), "deny");
        assert_eq!(describe(None), "inherit");
    }
}

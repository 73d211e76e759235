//! Subcommands of the `lingua` CLI.

pub mod config;
pub mod health;
pub mod registry;
pub mod roles;
pub mod rules;
pub mod users;

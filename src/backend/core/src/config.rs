//! Configuration management.
//!
//! Values come from an optional file layered under `LINGUA__`-prefixed
//! environment variables, e.g. `LINGUA_RBAC__HIGHEST_ROLE=root` or
//! `LINGUA_RBAC__DEFAULT_ROLES=admin,editor`.

use serde::Deserialize;
use std::time::Duration;

use crate::rbac::error::{RbacError, RbacResult};
use crate::telemetry::logging::LogFormat;

const ENV_PREFIX: &str = "LINGUA";

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Token validation
    #[serde(default)]
    pub auth: AuthSettings,

    /// Access control
    #[serde(default)]
    pub rbac: RbacConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Run migrations when the server starts
    #[serde(default)]
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Install the Prometheus recorder and serve `/metrics`
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Bearer-token validation. Tokens are issued elsewhere.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,

    /// HMAC secret shared with the token issuer
    pub jwt_secret: Option<String>,

    pub issuer: Option<String>,

    pub audience: Option<String>,

    /// Clock skew tolerated on `exp`/`nbf`, in seconds
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            jwt_secret: None,
            issuer: None,
            audience: None,
            leeway_secs: default_leeway_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RbacConfig {
    /// Logical service the rules belong to
    #[serde(default = "default_service")]
    pub service: String,

    /// Role that bypasses every check
    #[serde(default = "default_highest_role")]
    pub highest_role: String,

    /// Allow requests to routes that have no rule at all
    #[serde(default)]
    pub unassigned_routes_are_public: bool,

    /// Roles created at startup if missing
    #[serde(default = "default_roles")]
    pub default_roles: Vec<String>,

    /// Prefix added to declared paths that do not already carry it
    #[serde(default = "default_service_root")]
    pub service_root: String,

    /// Reconcile rules with the declared routes when the server starts
    #[serde(default)]
    pub sync_on_startup: bool,

    /// Deadline for one full synchronization
    #[serde(default = "default_sync_timeout", with = "humantime_serde")]
    pub sync_timeout: Duration,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            highest_role: default_highest_role(),
            unassigned_routes_are_public: false,
            default_roles: default_roles(),
            service_root: default_service_root(),
            sync_on_startup: false,
            sync_timeout: default_sync_timeout(),
        }
    }
}

impl RbacConfig {
    pub fn validate(&self) -> RbacResult<()> {
        if self.service.trim().is_empty() {
            return Err(RbacError::InvalidConfig("service name must not be empty".into()));
        }
        if !self.service_root.starts_with('/') {
            return Err(RbacError::InvalidConfig(format!(
                "service root must start with '/': {}",
                self.service_root
            )));
        }
        if self.highest_role.trim().is_empty() {
            return Err(RbacError::InvalidConfig("highest role must not be blank".into()));
        }
        if self.sync_timeout.is_zero() {
            return Err(RbacError::InvalidConfig("sync timeout must be positive".into()));
        }
        Ok(())
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_enabled() -> bool { true }
fn default_auth_enabled() -> bool { true }
fn default_leeway_secs() -> u64 { 60 }
fn default_service() -> String { "dd_backend".to_string() }
fn default_highest_role() -> String { "admin".to_string() }
fn default_roles() -> Vec<String> { vec!["admin".to_string()] }
fn default_service_root() -> String { "/api".to_string() }
fn default_sync_timeout() -> Duration { Duration::from_secs(60) }

impl Config {
    /// Load configuration from environment and the optional file named by
    /// `LINGUA_CONFIG` (default `config/default`).
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("LINGUA_CONFIG").unwrap_or_else(|_| "config/default".to_string());
        let config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.rbac.validate()?;
        if self.auth.enabled && self.auth.jwt_secret.as_deref().map(str::is_empty).unwrap_or(true) {
            anyhow::bail!("auth.jwt_secret is required when authentication is enabled");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!("database.min_connections exceeds database.max_connections");
        }
        Ok(())
    }

    /// `host:port` to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("rbac.default_roles")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rbac_defaults() {
        let rbac = RbacConfig::default();
        assert_eq!(rbac.service, "dd_backend");
        assert_eq!(rbac.highest_role, "admin");
        assert!(!rbac.unassigned_routes_are_public);
        assert_eq!(rbac.default_roles, vec!["admin".to_string()]);
        assert_eq!(rbac.service_root, "/api");
        assert_eq!(rbac.sync_timeout, Duration::from_secs(60));
        assert!(rbac.validate().is_ok());
    }

    #[test]
    fn test_rbac_validation() {
        let bad_root = RbacConfig {
            service_root: "api".into(),
            ..Default::default()
        };
        assert!(matches!(bad_root.validate(), Err(RbacError::InvalidConfig(_))));

        let blank_role = RbacConfig {
            highest_role: "  ".into(),
            ..Default::default()
        };
        assert!(blank_role.validate().is_err());

        let no_service = RbacConfig {
            service: String::new(),
            ..Default::default()
        };
        assert!(no_service.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgres://localhost/lingua"

[auth]
jwt_secret = "file-secret"

[rbac]
service = "billing"
highest_role = "root"
unassigned_routes_are_public = true
default_roles = ["root", "clerk"]
sync_timeout = "90s"

[observability]
log_format = "pretty"
"#
        )
        .unwrap();

        let cfg = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.rbac.service, "billing");
        assert_eq!(cfg.rbac.highest_role, "root");
        assert!(cfg.rbac.unassigned_routes_are_public);
        assert_eq!(cfg.rbac.default_roles, vec!["root", "clerk"]);
        assert_eq!(cfg.rbac.sync_timeout, Duration::from_secs(90));
        assert_eq!(cfg.rbac.service_root, "/api");
        assert_eq!(cfg.observability.log_format, LogFormat::Pretty);
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[database]\nurl = \"postgres://localhost/lingua\"").unwrap();
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }
}

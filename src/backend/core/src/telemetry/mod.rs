//! Telemetry: structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use lingua_core::config::ObservabilityConfig;
//! use lingua_core::telemetry::init_telemetry;
//!
//! let handle = init_telemetry(&ObservabilityConfig::default(), "lingua")
//!     .expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry, RegistryGauges};

use crate::config::ObservabilityConfig;

/// Initialize logging and metrics. Call once at startup.
///
/// # Errors
///
/// Returns an error if either subsystem fails to initialize.
pub fn init_telemetry(config: &ObservabilityConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    init_logging(&LoggingConfig::new(&config.log_level, config.log_format))?;

    let metrics = MetricsConfig {
        enabled: config.metrics_enabled,
        ..Default::default()
    };
    init_metrics(&metrics, service_name)
}

//! Prometheus metrics for authorization decisions and reconciliation.
//!
//! The counters and histograms are recorded where the work happens
//! (`rbac::policy`, `rbac::reconcile`, `error`); this module installs the
//! recorder, registers descriptions and renders the scrape output.

use metrics::{describe_counter, describe_histogram, gauge};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::collections::HashMap;

/// Buckets for `rbac_evaluate_duration_seconds`. Registry hits are
/// sub-millisecond, storage fallbacks a few milliseconds.
const EVALUATE_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
];

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Labels added to every series
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_labels: HashMap::new(),
        }
    }
}

/// Handle for rendering the Prometheus scrape output.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry that renders nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new()
        .add_global_label("service", service_name)
        .set_buckets_for_metric(
            Matcher::Full("rbac_evaluate_duration_seconds".to_string()),
            EVALUATE_BUCKETS,
        )?;
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "rbac_decisions_total",
        "Authorization decisions by outcome and reason"
    );
    describe_histogram!(
        "rbac_evaluate_duration_seconds",
        "Time spent deciding one request"
    );
    describe_counter!(
        "rbac_reconcile_runs_total",
        "Reconciliation runs by outcome"
    );
    describe_counter!("lingua_errors_total", "Application errors by code and category");
    describe_counter!("auth_errors_total", "Rejected bearer tokens by error type");
    describe_counter!("auth_success_total", "Accepted bearer tokens");
}

/// Registry sizes, refreshed after every reload.
pub struct RegistryGauges;

impl RegistryGauges {
    pub fn set(roles: usize, committed_routes: usize, fresh_routes: usize) {
        gauge!("rbac_roles").set(roles as f64);
        gauge!("rbac_committed_routes").set(committed_routes as f64);
        gauge!("rbac_fresh_routes").set(fresh_routes as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let registry = init_metrics(
            &MetricsConfig {
                enabled: false,
                ..Default::default()
            },
            "dd_backend",
        )
        .unwrap();
        assert!(!registry.is_enabled());
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_gauges_without_recorder_are_noops() {
        RegistryGauges::set(3, 10, 12);
    }
}

//! Prometheus metrics exposition
//!
//! The pool crate emits its counters through the `metrics` facade; this
//! module installs the recorder that renders them on `/metrics` and adds
//! per-service gauges refreshed on each scrape:
//!
//! - `credential_pool_credentials_available` (gauge): label `service`
//! - `credential_pool_credentials_total` (gauge): label `service`

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Publish per-service availability from a `Pool::health_all` summary.
pub fn record_pool_health(summary: &serde_json::Value) {
    let Some(services) = summary["services"].as_object() else {
        return;
    };
    for (service, health) in services {
        let available = health["credentials_available"].as_u64().unwrap_or(0);
        let total = health["credentials_total"].as_u64().unwrap_or(0);
        metrics::gauge!("credential_pool_credentials_available", "service" => service.clone())
            .set(available as f64);
        metrics::gauge!("credential_pool_credentials_total", "service" => service.clone())
            .set(total as f64);
    }
}

//! Prometheus metrics for flowrun.
//!
//! ## Metrics
//!
//! ### Counters
//! - `flowrun_runs_total` - Finished runs by status and mode
//! - `flowrun_nodes_executed_total` - Node executions by node_type and status
//! - `flowrun_node_retries_total` - Retries by error category
//! - `flowrun_jobs_total` - Queue deliveries by outcome
//! - `flowrun_http_requests_total` - HTTP node requests by method and status
//!
//! ### Histograms
//! - `flowrun_run_duration_seconds` - Run duration by workflow
//! - `flowrun_node_duration_seconds` - Node duration by node_type
//!
//! ### Gauges
//! - `flowrun_active_runs` - Runs currently owned by a worker
//! - `flowrun_circuit_state` - 0 closed, 1 open, 2 half-open, by service

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("failed to install metrics recorder: {}", e)))?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());
    Ok(handle)
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Run Metrics
// =============================================================================

pub fn record_run(status: &str, mode: &str) {
    counter!(
        "flowrun_runs_total",
        "status" => status.to_string(),
        "mode" => mode.to_string()
    )
    .increment(1);
}

pub fn record_run_duration(duration: Duration, workflow_name: &str) {
    histogram!(
        "flowrun_run_duration_seconds",
        "workflow" => workflow_name.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn inc_active_runs() {
    gauge!("flowrun_active_runs").increment(1.0);
}

pub fn dec_active_runs() {
    gauge!("flowrun_active_runs").decrement(1.0);
}

// =============================================================================
// Node Metrics
// =============================================================================

pub fn record_node_execution(node_type: &str, status: &str) {
    counter!(
        "flowrun_nodes_executed_total",
        "node_type" => node_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_node_duration(duration: Duration, node_type: &str) {
    histogram!(
        "flowrun_node_duration_seconds",
        "node_type" => node_type.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_retry(category: &str) {
    counter!(
        "flowrun_node_retries_total",
        "category" => category.to_string()
    )
    .increment(1);
}

pub fn record_http_request(method: &str, status_code: u16) {
    counter!(
        "flowrun_http_requests_total",
        "method" => method.to_string(),
        "status" => status_code.to_string()
    )
    .increment(1);
}

// =============================================================================
// Resilience and Queue Metrics
// =============================================================================

pub fn record_circuit_state(service: &str, state: u8) {
    gauge!(
        "flowrun_circuit_state",
        "service" => service.to_string()
    )
    .set(state as f64);
}

pub fn record_job(outcome: &str) {
    counter!(
        "flowrun_jobs_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_never_empty() {
        // Other tests may have installed the recorder already
        assert!(!render_metrics().is_empty());
    }
}

//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple processes-worth of setup share a process). Metric recording
/// still works, routed to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!("fleetmux_requests_total", "Client requests forwarded per path");
    describe_histogram!(
        "fleetmux_request_ttfb_seconds",
        "Time from request receipt to upstream response headers"
    );
    describe_counter!(
        "fleetmux_placement_total",
        "Placement decisions by mode (direct / wait / load)"
    );
    describe_counter!(
        "fleetmux_gate_timeouts_total",
        "Requests that timed out waiting for a model to become ready"
    );
    describe_gauge!(
        "fleetmux_node_rtt_ewma_ms",
        "EWMA round-trip latency per worker in milliseconds"
    );
    describe_counter!(
        "fleetmux_unloads_total",
        "Unload commands issued by the planner, by reason"
    );
}

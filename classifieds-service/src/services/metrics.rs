//! Metrics collection for classifieds-service.
//!
//! HTTP request metrics come from `service_core::middleware::metrics`; the
//! store connection lifecycle adds its own counters and a readiness gauge.

use crate::services::connection::ReadyState;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Calling it twice is a no-op.
pub fn init_metrics() -> Result<(), anyhow::Error> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

    METRICS_HANDLE.set(handle).ok();
    Ok(())
}

/// Get metrics output in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

pub fn record_connect_attempt() {
    metrics::counter!("store_connect_attempts_total").increment(1);
}

pub fn record_connect_failure() {
    metrics::counter!("store_connect_failures_total").increment(1);
}

pub fn set_ready_state(state: ReadyState) {
    metrics::gauge!("store_ready_state").set(f64::from(state.code()));
}

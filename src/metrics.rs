//! Metrics facade. Call sites use these named functions instead of the raw
//! `metrics::{counter,gauge,histogram}!` macros directly, so a metric name
//! or label set only needs to change in one place.

use metrics_exporter_prometheus::PrometheusBuilder;

/// Installs the global Prometheus recorder and spawns its HTTP listener.
/// Must be called once at process startup before any metric macro fires.
pub fn install_exporter(port: u16) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

pub fn record_provider_latency(provider: &str, seconds: f64) {
    metrics::histogram!("data_plane_provider_latency_seconds", "provider" => provider.to_string())
        .record(seconds);
}

pub fn inc_provider_rate_limited(provider: &str) {
    metrics::counter!("data_plane_provider_rate_limited_total", "provider" => provider.to_string())
        .increment(1);
}

pub fn inc_provider_failure(provider: &str) {
    metrics::counter!("data_plane_provider_failure_total", "provider" => provider.to_string())
        .increment(1);
}

pub fn record_detector_duration(detector: &str, seconds: f64) {
    metrics::histogram!("signal_generator_detector_duration_seconds", "detector" => detector.to_string())
        .record(seconds);
}

pub fn inc_signal_emitted(signal_type: &str) {
    metrics::counter!("signal_generator_signals_emitted_total", "signal_type" => signal_type.to_string())
        .increment(1);
}

pub fn inc_dispatcher_duplicate_suppressed() {
    metrics::counter!("dispatcher_duplicate_suppressed_total").increment(1);
}

pub fn inc_dispatcher_jobs_enqueued() {
    metrics::counter!("dispatcher_jobs_enqueued_total").increment(1);
}

pub fn inc_executor_agent_failure(agent_type: &str) {
    metrics::counter!("executor_agent_failure_total", "agent_type" => agent_type.to_string())
        .increment(1);
}

pub fn inc_trade_manager_communication_error(phase: &str) {
    metrics::counter!("trade_manager_communication_error_total", "phase" => phase.to_string())
        .increment(1);
}

pub fn set_trade_manager_active_monitors(count: f64) {
    metrics::gauge!("trade_manager_active_monitors").set(count);
}

pub fn inc_reconciliation_outcome(outcome: &str) {
    metrics::counter!("reconciliation_outcome_total", "outcome" => outcome.to_string())
        .increment(1);
}

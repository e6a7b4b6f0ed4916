//! Metrics implementation using Prometheus.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use switchboard_core::{types::RuleAction, Error, Result};

/// Initialize Prometheus recorder and return the handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let builder = PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// Count a finished chat-completion request by final outcome label.
pub fn track_request(outcome: &str, status: u16, latency_sec: f64) {
    metrics::counter!(
        "switchboard_requests_total",
        "outcome" => outcome.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!("switchboard_request_duration_seconds", "outcome" => outcome.to_string())
        .record(latency_sec);
}

/// Count a rule match.
pub fn track_policy_match(rule_id: &str, action: RuleAction) {
    let action = match action {
        RuleAction::Block => "block",
        RuleAction::ShadowLog => "shadow_log",
    };
    metrics::counter!(
        "switchboard_policy_matches_total",
        "rule" => rule_id.to_string(),
        "action" => action
    )
    .increment(1);
}

/// Count an admission result ("granted" / "denied").
pub fn track_admission(result: &'static str) {
    metrics::counter!("switchboard_admission_total", "result" => result).increment(1);
}

pub fn track_in_flight(current: usize) {
    metrics::gauge!("switchboard_admission_in_flight").set(current as f64);
}

/// Record an upstream call by outcome class.
pub fn track_upstream(class: &'static str, latency_sec: f64) {
    metrics::counter!("switchboard_upstream_total", "class" => class).increment(1);
    metrics::histogram!("switchboard_upstream_duration_seconds", "class" => class).record(latency_sec);
}

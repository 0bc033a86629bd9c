//! Metrics definitions for the Broadcast Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `bc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code, never by user input:
//! - `role`: speaker, listener
//! - `operation`: store primitives (~13) or rate limited operations (5)
//! - `outcome` / `decision` / `status`: small fixed sets
//! - `circuit`: one per protected dependency (2)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to serve
/// `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Store round trips, p99 target 10ms
        .set_buckets_for_metric(
            Matcher::Prefix("bc_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("bc_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("bc_fanout".to_string()),
            &[0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500],
        )
        .map_err(|e| format!("Failed to set fan-out buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

/// Record a connect attempt.
///
/// Metric: `bc_connects_total`
/// Labels: `role`, `outcome` (success or an error category)
pub fn record_connect(role: &str, outcome: &str) {
    counter!("bc_connects_total", "role" => role.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a completed disconnect.
///
/// Metric: `bc_disconnects_total`
/// Labels: `role`, `reason` (client, timeout, gone, session_ended)
pub fn record_disconnect(role: &str, reason: &str) {
    counter!("bc_disconnects_total", "role" => role.to_string(), "reason" => reason.to_string())
        .increment(1);
}

/// Metric: `bc_refreshes_total`
/// Labels: `role`, `outcome`
pub fn record_refresh(role: &str, outcome: &str) {
    counter!("bc_refreshes_total", "role" => role.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a heartbeat response.
///
/// Metric: `bc_heartbeats_total`
/// Labels: `outcome` (ack, refresh_required, warning, degraded)
pub fn record_heartbeat(outcome: &str) {
    counter!("bc_heartbeats_total", "outcome" => outcome.to_string()).increment(1);
}

/// Metric: `bc_audio_chunks_total`
/// Labels: `outcome` (forwarded, rejected)
pub fn record_audio_chunk(outcome: &str) {
    counter!("bc_audio_chunks_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record processing time of one inbound gateway event.
///
/// Metric: `bc_message_latency_seconds`
/// Labels: `action`
///
/// Cardinality: bounded by the closed set of client actions (~15)
pub fn record_message_latency(action: &str, duration: Duration) {
    histogram!("bc_message_latency_seconds", "action" => action.to_string())
        .record(duration.as_secs_f64());
}

/// Set the number of sockets held by this process.
///
/// Metric: `bc_gateway_connections`
/// Labels: none
pub fn set_gateway_connections(count: usize) {
    // usize to f64 conversion is safe for realistic socket counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("bc_gateway_connections").set(count as f64);
}

// ============================================================================
// Broadcast Fan-out
// ============================================================================

/// Record one fan-out of a broadcast event to a session's listeners.
///
/// Metrics:
/// - `bc_fanout_deliveries_total` (labels: `result` = delivered, failed)
/// - `bc_fanout_duration_seconds` (no labels)
pub fn record_fanout(delivered: usize, failed: usize, duration: Duration) {
    histogram!("bc_fanout_duration_seconds").record(duration.as_secs_f64());
    counter!("bc_fanout_deliveries_total", "result" => "delivered")
        .increment(u64::try_from(delivered).unwrap_or(u64::MAX));
    if failed > 0 {
        counter!("bc_fanout_deliveries_total", "result" => "failed")
            .increment(u64::try_from(failed).unwrap_or(u64::MAX));
    }
}

/// Metric: `bc_broadcast_controls_total`
/// Labels: `control` (pause, resume, mute, unmute, volume, state)
pub fn record_broadcast_control(control: &str) {
    counter!("bc_broadcast_controls_total", "control" => control.to_string()).increment(1);
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Record a rate limit decision.
///
/// Metric: `bc_rate_limit_decisions_total`
/// Labels: `operation`, `decision` (allowed, rejected, fail_open)
///
/// Cardinality: 15 (5 operations x 3 decisions)
pub fn record_rate_limit_decision(operation: &str, decision: &str) {
    counter!("bc_rate_limit_decisions_total",
        "operation" => operation.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

// ============================================================================
// Store & Resilience
// ============================================================================

/// Record a store call as seen by callers, retries included.
///
/// Metrics:
/// - `bc_store_operation_duration_seconds` (labels: `operation`)
/// - `bc_store_operations_total` (labels: `operation`, `outcome`)
pub fn record_store_operation(operation: &str, outcome: &str, duration: Duration) {
    histogram!("bc_store_operation_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
    counter!("bc_store_operations_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Metric: `bc_retries_total`
/// Labels: `operation`
pub fn record_retry(operation: &str) {
    counter!("bc_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a circuit breaker state change.
///
/// Metrics:
/// - `bc_circuit_transitions_total` (labels: `circuit`, `to`)
/// - `bc_circuit_open` gauge, 1 while the circuit is not closed
pub fn record_circuit_transition(circuit: &str, to: &str) {
    counter!("bc_circuit_transitions_total",
        "circuit" => circuit.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
    let open = if to == "closed" { 0.0 } else { 1.0 };
    gauge!("bc_circuit_open", "circuit" => circuit.to_string()).set(open);
}

/// Metric: `bc_circuit_rejections_total`
/// Labels: `circuit`
pub fn record_circuit_rejection(circuit: &str) {
    counter!("bc_circuit_rejections_total", "circuit" => circuit.to_string()).increment(1);
}

/// Record a response served by a fallback.
///
/// Metric: `bc_degraded_responses_total`
/// Labels: `dependency`
pub fn record_degraded(dependency: &str) {
    counter!("bc_degraded_responses_total", "dependency" => dependency.to_string()).increment(1);
}

// ============================================================================
// Authorization
// ============================================================================

/// Metric: `bc_jwks_refreshes_total`
/// Labels: `status` (success, error)
pub fn record_jwks_refresh(status: &str) {
    counter!("bc_jwks_refreshes_total", "status" => status.to_string()).increment(1);
}

/// Record an identity token check.
///
/// Metric: `bc_token_validations_total`
/// Labels: `outcome` (success or a fixed rejection reason)
pub fn record_token_validation(outcome: &str) {
    counter!("bc_token_validations_total", "outcome" => outcome.to_string()).increment(1);
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Metric: `bc_timeout_sweep_removed_total`
/// Labels: none
pub fn record_sweep_removals(count: usize) {
    counter!("bc_timeout_sweep_removed_total").increment(u64::try_from(count).unwrap_or(u64::MAX));
}

/// Metric: `bc_status_updates_total`
/// Labels: `reason`
pub fn record_status_update(reason: &str) {
    counter!("bc_status_updates_total", "reason" => reason.to_string()).increment(1);
}

/// Metric: `bc_sessions_active`
/// Labels: none
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("bc_sessions_active").set(count as f64);
}

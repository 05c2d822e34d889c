//! Metrics definitions for the signaling hub.
//!
//! All metrics follow Prometheus naming conventions:
//! - `hub_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 2 values (room, connection)
//! - `message_type`: bounded by envelope tags (~10 values)
//! - `reason`: bounded admission failures (capacity, id_allocation, draining)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Room message handling is
/// a single in-memory mutation plus fan-out, so latency buckets start at
/// 100 microseconds.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("hub_message".to_string()),
            &[
                0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Membership & Connection Metrics (Gauges)
// ============================================================================

/// Set the number of registered participants.
///
/// Metric: `hub_peers_active`
pub fn set_peers_active(count: usize) {
    // usize to f64 conversion is safe for realistic room sizes (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_peers_active").set(count as f64);
}

/// Set the number of open WebSocket connections, joined or not.
///
/// Metric: `hub_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_connections_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `hub_actor_mailbox_depth`
/// Labels: `actor_type` (room, connection)
///
/// High values indicate the room actor is falling behind.
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Message Metrics
// ============================================================================

/// Record an inbound participant message.
///
/// Metric: `hub_messages_total`
/// Labels: `message_type`
pub fn record_message(message_type: &str) {
    counter!("hub_messages_total", "message_type" => message_type.to_string()).increment(1);
}

/// Record room processing latency for one inbound message.
///
/// Metric: `hub_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("hub_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record a relayed message dropped because its target is not registered.
///
/// Metric: `hub_relay_dropped_total`
pub fn record_relay_dropped() {
    counter!("hub_relay_dropped_total").increment(1);
}

// ============================================================================
// Admission & Eviction Metrics (Counters)
// ============================================================================

/// Record a rejected join.
///
/// Metric: `hub_join_rejected_total`
/// Labels: `reason` (capacity, id_allocation, draining)
pub fn record_join_rejected(reason: &str) {
    counter!("hub_join_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record a participant evicted for a full or closed outbound queue.
///
/// Metric: `hub_evictions_total`
pub fn record_eviction() {
    counter!("hub_evictions_total").increment(1);
}

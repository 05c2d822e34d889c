//! Observability for the signaling hub.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Chat text, usernames and session descriptions are never logged or used
//! as metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `hub_peers_active` | Gauge | none | Registered participants |
//! | `hub_connections_active` | Gauge | none | Open WebSocket connections |
//! | `hub_actor_mailbox_depth` | Gauge | `actor_type` | Room backpressure |
//! | `hub_messages_total` | Counter | `message_type` | Inbound envelopes |
//! | `hub_message_latency_seconds` | Histogram | `message_type` | Room processing time |
//! | `hub_join_rejected_total` | Counter | `reason` | Failed admissions |
//! | `hub_relay_dropped_total` | Counter | none | Relays to absent targets |
//! | `hub_evictions_total` | Counter | none | Slow-consumer evictions |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;

//! HTTP routes for the signaling hub.
//!
//! Defines the Axum router and application state.

use crate::actors::{ActorMetrics, RoomHandle};
use crate::config::Config;
use crate::observability::{health_router, HealthState};
use crate::ws;

use axum::{extract::State, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all handlers.
pub struct AppState {
    pub config: Config,

    /// Handle to the room actor.
    pub room: RoomHandle,

    pub metrics: Arc<ActorMetrics>,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/ws` - Participant signaling channel (WebSocket upgrade)
/// - `/health` - Liveness check
/// - `/ready` - Readiness check
/// - `/metrics` - Prometheus metrics, when a recorder is installed
/// - TraceLayer for request logging
pub fn build_routes(
    state: Arc<AppState>,
    health: Arc<HealthState>,
    metrics_handle: Option<PrometheusHandle>,
) -> Router {
    let mut router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .merge(health_router(health));

    if let Some(handle) = metrics_handle {
        router = router.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(handle),
        );
    }

    router.layer(TraceLayer::new_for_http())
}

/// Render all registered metrics in Prometheus text format.
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

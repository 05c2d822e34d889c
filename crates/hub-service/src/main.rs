//! Signaling hub
//!
//! WebSocket relay for full-mesh audio/video rooms.
//!
//! # Endpoints
//!
//! One HTTP listener (default: 0.0.0.0:8080) serves:
//! - `/ws` participant signaling channel
//! - `/health` and `/ready` health checks
//! - `/metrics` Prometheus scrape endpoint
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Spawn the `RoomActor`
//! 4. Bind the listener and mark ready
//! 5. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use hub_service::actors::{ActorMetrics, RoomActor};
use hub_service::config::Config;
use hub_service::observability::{init_metrics_recorder, HealthState};
use hub_service::routes::{build_routes, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for the room actor to close connections on shutdown.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hub_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(target: "hub.startup", "Starting signaling hub");

    let config = Config::from_env().map_err(|e| {
        error!(target: "hub.startup", "Failed to load configuration: {}", e);
        e
    })?;

    info!(
        target: "hub.startup",
        bind_address = %config.bind_address,
        max_participants = config.max_participants,
        outbound_buffer = config.outbound_buffer,
        room_mailbox = config.room_mailbox,
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(target: "hub.startup", error = %e, "Failed to initialize metrics recorder");
        std::io::Error::other(e)
    })?;

    let shutdown_token = CancellationToken::new();
    let metrics = ActorMetrics::new();
    let (room, room_task) = RoomActor::spawn(&config, shutdown_token.child_token(), metrics.clone());

    let health_state = Arc::new(HealthState::new());
    let state = Arc::new(AppState {
        config: config.clone(),
        room,
        metrics,
    });
    let app = build_routes(state, Arc::clone(&health_state), Some(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            error!(target: "hub.startup", error = %e, bind_address = %config.bind_address, "Failed to bind listener");
            e
        })?;
    info!(target: "hub.startup", addr = %listener.local_addr()?, "Signaling hub listening");

    let server_token = shutdown_token.clone();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_token.cancelled().await;
        });
        if let Err(e) = server.await {
            error!(target: "hub.startup", error = %e, "HTTP server failed");
        }
    });

    health_state.set_ready();
    info!(target: "hub.startup", "Signaling hub running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!(target: "hub.startup", "Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();
    shutdown_token.cancel();

    if tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, room_task)
        .await
        .is_err()
    {
        warn!(target: "hub.startup", "Room actor shutdown timed out");
    }
    if tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, server)
        .await
        .is_err()
    {
        warn!(target: "hub.startup", "HTTP server shutdown timed out");
    }

    info!(target: "hub.startup", "Signaling hub shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

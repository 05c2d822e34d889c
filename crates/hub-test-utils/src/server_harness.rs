//! Test server harness for E2E testing
//!
//! Provides `TestHubServer` for spawning real hub instances in tests.

use hub_service::actors::{ActorMetrics, RoomActor, RoomHandle};
use hub_service::config::Config;
use hub_service::observability::HealthState;
use hub_service::routes::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test harness for spawning the signaling hub in E2E tests.
///
/// # Example
/// ```rust,ignore
/// let server = TestHubServer::spawn().await?;
/// let (socket, _) = tokio_tungstenite::connect_async(server.ws_url()).await?;
/// ```
pub struct TestHubServer {
    addr: SocketAddr,
    config: Config,
    room: RoomHandle,
    metrics: Arc<ActorMetrics>,
    cancel_token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestHubServer {
    /// Spawn a hub with default configuration.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with_config(Config::default()).await
    }

    /// Spawn a hub with the given configuration.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0), ignoring `bind_address`
    /// - Start the room actor and HTTP server in the background
    pub async fn spawn_with_config(config: Config) -> Result<Self, anyhow::Error> {
        let cancel_token = CancellationToken::new();
        let metrics = ActorMetrics::new();
        let (room, _room_task) =
            RoomActor::spawn(&config, cancel_token.child_token(), Arc::clone(&metrics));

        let health = Arc::new(HealthState::new());
        health.set_ready();

        let state = Arc::new(AppState {
            config: config.clone(),
            room: room.clone(),
            metrics: Arc::clone(&metrics),
        });
        let app = routes::build_routes(state, health, None);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let shutdown = cancel_token.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            });
            if let Err(e) = server.await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            room,
            metrics,
            cancel_token,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the WebSocket URL participants connect to.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle to the running room, for state assertions.
    pub fn room(&self) -> &RoomHandle {
        &self.room
    }

    pub fn metrics(&self) -> &ActorMetrics {
        &self.metrics
    }

    /// Stop the room and the HTTP server.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for TestHubServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self._handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_spawns_successfully() -> Result<(), anyhow::Error> {
        let server = TestHubServer::spawn().await?;

        assert!(server.url().starts_with("http://127.0.0.1:"));
        assert!(server.ws_url().ends_with("/ws"));
        assert!(server.addr().ip().is_loopback());
        assert!(server.addr().port() > 0);

        let state = server.room().get_state().await?;
        assert_eq!(state.peer_count(), 0);
        assert_eq!(state.max_participants, server.config().max_participants);

        Ok(())
    }
}

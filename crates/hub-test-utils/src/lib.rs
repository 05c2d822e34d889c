//! # Hub Test Utilities
//!
//! Harness for exercising the signaling hub over real sockets.
//!
//! - [`TestHubServer`] - a hub bound to `127.0.0.1:0` with its own room
//! - [`TestWsClient`] - a raw-protocol participant for driving the hub
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hub_test_utils::{TestHubServer, TestWsClient};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = TestHubServer::spawn().await.unwrap();
//!     let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
//!     let alice_id = alice.join("alice").await;
//! }
//! ```

pub mod server_harness;
pub mod ws_client;

pub use server_harness::TestHubServer;
pub use ws_client::TestWsClient;

//! Mesh client configuration.
//!
//! The mesh client is a library embedded in a participant application, so
//! configuration is built in code: start from [`MeshConfig::default`] and
//! override with the `with_*` setters.

use crate::supervisor::RetryPolicy;

use std::time::Duration;

/// Default time a link has to reach `Connected`, and a renegotiation has
/// to be answered.
pub const DEFAULT_ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for `username_accepted`.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound on closing one link.
pub const DEFAULT_LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default length of the hub outbound and inbound queues.
pub const DEFAULT_HUB_BUFFER: usize = 256;

/// Default mesh controller mailbox length.
pub const DEFAULT_COMMAND_BUFFER: usize = 64;

/// Mesh client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Establishment and renegotiation timeout per link (default: 10s).
    pub establishment_timeout: Duration,

    /// Backoff applied to failed links.
    pub retry_policy: RetryPolicy,

    /// How long `RoomSession::join` waits for acceptance (default: 10s).
    pub join_timeout: Duration,

    pub link_close_timeout: Duration,

    /// Queue length between the hub socket and the controller, each way.
    pub hub_buffer: usize,

    /// Mailbox length of the controller and of each link.
    pub command_buffer: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            establishment_timeout: DEFAULT_ESTABLISHMENT_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            link_close_timeout: DEFAULT_LINK_CLOSE_TIMEOUT,
            hub_buffer: DEFAULT_HUB_BUFFER,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

impl MeshConfig {
    #[must_use]
    pub fn with_establishment_timeout(mut self, timeout: Duration) -> Self {
        self.establishment_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_link_close_timeout(mut self, timeout: Duration) -> Self {
        self.link_close_timeout = timeout;
        self
    }

    /// Set the hub queue length. Zero is raised to one.
    #[must_use]
    pub fn with_hub_buffer(mut self, buffer: usize) -> Self {
        self.hub_buffer = buffer.max(1);
        self
    }

    /// Set the controller and link mailbox length. Zero is raised to one.
    #[must_use]
    pub fn with_command_buffer(mut self, buffer: usize) -> Self {
        self.command_buffer = buffer.max(1);
        self
    }
}

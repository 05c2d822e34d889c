//! Actor metrics and mailbox monitoring.
//!
//! Provides mailbox depth monitoring with per-actor thresholds:
//!
//! | Actor Type | Normal | Warning  | Critical |
//! |------------|--------|----------|----------|
//! | Room       | < 256  | 256-768  | > 768    |
//! | Connection | < 64   | 64-192   | > 192    |
//!
//! Depth is also published as the `hub_actor_mailbox_depth` gauge.

use crate::observability::metrics as prom;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the room actor.
pub const ROOM_MAILBOX_NORMAL: usize = 256;
pub const ROOM_MAILBOX_WARNING: usize = 768;

/// Mailbox depth thresholds for connection actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 64;
pub const CONNECTION_MAILBOX_WARNING: usize = 192;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RoomActor` (singleton).
    Room,
    /// `ConnectionActor` (one per WebSocket).
    Connection,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    /// Returns the warning threshold for this actor type.
    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Room => ROOM_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Room => ROOM_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    /// Below normal threshold.
    Normal,
    /// Between normal and warning thresholds.
    Warning,
    /// Above warning threshold.
    Critical,
}

/// Mailbox monitor for tracking queue depth and emitting metrics.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Actor identifier (connection id, or "room").
    actor_id: String,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    /// Create a new mailbox monitor for the given actor.
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record the current backlog of the actor's receiver.
    ///
    /// Called with `Receiver::len()` each time the actor picks up a message.
    pub fn record_depth(&self, depth: usize) {
        if self.actor_type == ActorType::Room {
            prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
        }

        match self.level_for_depth(depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "hub.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = depth,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if depth == self.actor_type.normal_threshold() + 1 => {
                // Log once when crossing into the warning band
                debug!(
                    target: "hub.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    /// Record a message as processed.
    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated metrics for the actor system.
///
/// Shared between the room actor and the WebSocket handlers. All fields
/// are atomic.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// WebSocket connections currently open (joined or not).
    pub active_connections: AtomicUsize,
    /// Peers evicted for a full or closed outbound queue.
    pub evictions: AtomicU64,
}

impl ActorMetrics {
    /// Create a new shared metrics instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish the current peer count.
    pub fn set_peers(&self, count: usize) {
        prom::set_peers_active(count);
    }

    /// Increment active connection count. Returns the new count.
    pub fn connection_created(&self) -> usize {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_connections_active(count);
        count
    }

    /// Decrement active connection count. Returns the new count.
    pub fn connection_closed(&self) -> usize {
        let previous = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or_else(|n| n);
        let count = previous.saturating_sub(1);
        prom::set_connections_active(count);
        count
    }

    /// Record a slow-consumer eviction.
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        prom::record_eviction();
    }

    #[must_use]
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

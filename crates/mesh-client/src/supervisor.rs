//! Reconnection supervisor.
//!
//! Schedules link re-creation after failures with exponential backoff.
//! Timers run as detached tasks that post a [`RetryFired`] back to the
//! controller; each holds a child of the controller's cancellation token,
//! so a departure, a leave or a controller shutdown silences them. The
//! token is checked when the timer fires and again when the controller
//! accepts the retry.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling on the retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(16);

/// Default number of retries before a peer is declared unreachable.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// A retry timer that elapsed.
#[derive(Debug, Clone)]
pub struct RetryFired {
    pub remote_id: String,
    pub attempt: u32,
    token: CancellationToken,
}

/// What the supervisor decided about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A retry timer is running.
    Scheduled { attempt: u32, delay: Duration },
    /// Retries are used up. Reported once per exhaustion.
    Exhausted,
    /// Already exhausted; nothing further happens.
    Suppressed,
}

#[derive(Debug)]
struct PendingRetry {
    attempt: u32,
    token: CancellationToken,
}

/// Per-peer retry bookkeeping, owned by the mesh controller.
#[derive(Debug)]
pub struct Supervisor {
    policy: RetryPolicy,
    parent: CancellationToken,
    fired_tx: mpsc::UnboundedSender<RetryFired>,
    /// Consecutive failures since the last `Connected`.
    attempts: HashMap<String, u32>,
    pending: HashMap<String, PendingRetry>,
    exhausted: HashSet<String>,
}

impl Supervisor {
    /// Create a supervisor whose timers report on `fired_tx`.
    #[must_use]
    pub fn new(
        policy: RetryPolicy,
        parent: CancellationToken,
        fired_tx: mpsc::UnboundedSender<RetryFired>,
    ) -> Self {
        Self {
            policy,
            parent,
            fired_tx,
            attempts: HashMap::new(),
            pending: HashMap::new(),
            exhausted: HashSet::new(),
        }
    }

    /// Record a link failure and schedule the next retry, if any remain.
    pub fn on_failed(&mut self, remote_id: &str) -> FailureOutcome {
        if self.exhausted.contains(remote_id) {
            return FailureOutcome::Suppressed;
        }

        let attempt = {
            let count = self.attempts.entry(remote_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt > self.policy.max_retries {
            self.cancel_pending(remote_id);
            self.attempts.remove(remote_id);
            self.exhausted.insert(remote_id.to_string());
            warn!(
                target: "mesh.supervisor",
                remote_id = %remote_id,
                retries = self.policy.max_retries,
                "Peer unreachable, retries exhausted"
            );
            return FailureOutcome::Exhausted;
        }

        let delay = self.policy.delay_for(attempt);
        self.schedule(remote_id, attempt, delay);
        FailureOutcome::Scheduled { attempt, delay }
    }

    /// A link reached `Connected`: the next failure starts from attempt 1.
    pub fn on_connected(&mut self, remote_id: &str) {
        if self.attempts.remove(remote_id).is_some() {
            debug!(
                target: "mesh.supervisor",
                remote_id = %remote_id,
                "Retry count reset"
            );
        }
    }

    /// Accept a fired timer. Returns false for a cancelled or superseded
    /// timer, which the controller must ignore.
    pub fn accept(&mut self, fired: &RetryFired) -> bool {
        if fired.token.is_cancelled() {
            return false;
        }

        match self.pending.get(&fired.remote_id) {
            Some(pending) if pending.attempt == fired.attempt => {
                self.pending.remove(&fired.remote_id);
                true
            }
            _ => false,
        }
    }

    /// Cancel a pending retry so the link can be created immediately.
    /// Returns true if one was pending.
    pub fn take_pending(&mut self, remote_id: &str) -> bool {
        self.cancel_pending(remote_id)
    }

    #[must_use]
    pub fn has_pending(&self, remote_id: &str) -> bool {
        self.pending.contains_key(remote_id)
    }

    #[must_use]
    pub fn is_exhausted(&self, remote_id: &str) -> bool {
        self.exhausted.contains(remote_id)
    }

    /// Lift exhaustion for a peer that a fresh membership update lists.
    pub fn clear_exhausted(&mut self, remote_id: &str) -> bool {
        self.exhausted.remove(remote_id)
    }

    #[must_use]
    pub fn attempts(&self, remote_id: &str) -> u32 {
        self.attempts.get(remote_id).copied().unwrap_or(0)
    }

    /// Drop all state for a departed peer.
    pub fn forget(&mut self, remote_id: &str) {
        self.cancel_pending(remote_id);
        self.attempts.remove(remote_id);
        self.exhausted.remove(remote_id);
    }

    /// Drop all state for peers not in `present`.
    pub fn retain(&mut self, present: &HashSet<String>) {
        let departed: Vec<String> = self
            .attempts
            .keys()
            .chain(self.pending.keys())
            .chain(self.exhausted.iter())
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();

        for remote_id in departed {
            self.forget(&remote_id);
        }
    }

    /// Cancel every pending retry.
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.token.cancel();
        }
        self.attempts.clear();
    }

    fn cancel_pending(&mut self, remote_id: &str) -> bool {
        match self.pending.remove(remote_id) {
            Some(pending) => {
                pending.token.cancel();
                true
            }
            None => false,
        }
    }

    fn schedule(&mut self, remote_id: &str, attempt: u32, delay: Duration) {
        self.cancel_pending(remote_id);

        let token = self.parent.child_token();
        let fired = RetryFired {
            remote_id: remote_id.to_string(),
            attempt,
            token: token.clone(),
        };
        let fired_tx = self.fired_tx.clone();
        let timer_token = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = timer_token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if !fired.token.is_cancelled() {
                        let _ = fired_tx.send(fired);
                    }
                }
            }
        });

        info!(
            target: "mesh.supervisor",
            remote_id = %remote_id,
            attempt = attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Link retry scheduled"
        );

        self.pending
            .insert(remote_id.to_string(), PendingRetry { attempt, token });
    }
}

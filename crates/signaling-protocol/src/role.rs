//! Deterministic offerer selection.
//!
//! Both ends of a pair compute the role from the two peer ids alone, so
//! exactly one side offers and simultaneous discovery cannot produce glare.

/// Role of the local side on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Creates and sends the offer.
    Initiator,
    /// Waits for the offer and answers it.
    Responder,
}

impl LinkRole {
    /// Role of `local_id` on its link toward `remote_id`.
    #[must_use]
    pub fn for_pair(local_id: &str, remote_id: &str) -> Self {
        if is_initiator(local_id, remote_id) {
            LinkRole::Initiator
        } else {
            LinkRole::Responder
        }
    }

    #[must_use]
    pub const fn is_initiator(&self) -> bool {
        matches!(self, LinkRole::Initiator)
    }
}

/// The lexicographically smaller id offers.
#[must_use]
pub fn is_initiator(local_id: &str, remote_id: &str) -> bool {
    local_id.as_bytes() < remote_id.as_bytes()
}

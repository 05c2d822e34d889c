//! Peer registry owned by the room actor.
//!
//! Keeps peers in join order and indexes them by connection so the room can
//! resolve an inbound envelope to its sender. The registry is plain data:
//! it is never shared, only mutated from inside `RoomActor`.

use crate::actors::ConnectionActorHandle;
use crate::errors::HubError;

use chrono::{DateTime, Utc};
use rand::Rng;
use signaling_protocol::{AudioState, MediaKind, UserEntry, VideoState};
use std::collections::HashMap;

/// Length of generated peer ids.
pub const PEER_ID_LEN: usize = 9;

/// Number of fresh ids tried before a join fails with `id_allocation_failed`.
pub const MAX_ID_ATTEMPTS: usize = 16;

/// Source of candidate peer ids.
pub trait IdGenerator: Send {
    fn generate(&mut self) -> String;
}

/// Random lowercase base-36 ids of [`PEER_ID_LEN`] characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&mut self) -> String {
        let mut rng = rand::thread_rng();
        (0..PEER_ID_LEN)
            .filter_map(|_| char::from_digit(rng.gen_range(0..36), 36))
            .collect()
    }
}

/// One registered participant.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
    pub connection: ConnectionActorHandle,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub joined_at: DateTime<Utc>,
}

impl Peer {
    /// A freshly joined peer with both media flags off.
    #[must_use]
    pub fn new(id: String, display_name: String, connection: ConnectionActorHandle) -> Self {
        Self {
            id,
            display_name,
            connection,
            audio_enabled: false,
            video_enabled: false,
            joined_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<String, Peer>,
    /// Peer ids in join order.
    order: Vec<String>,
    /// connection id -> peer id
    by_connection: HashMap<String, String>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    #[must_use]
    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    #[must_use]
    pub fn peer_for_connection(&self, connection_id: &str) -> Option<&Peer> {
        self.by_connection
            .get(connection_id)
            .and_then(|id| self.peers.get(id))
    }

    /// Draw ids until one is unused.
    ///
    /// # Errors
    ///
    /// Returns `HubError::IdAllocation` if every candidate collided.
    pub fn allocate_id(&self, generator: &mut dyn IdGenerator) -> Result<String, HubError> {
        (0..MAX_ID_ATTEMPTS)
            .map(|_| generator.generate())
            .find(|candidate| !candidate.is_empty() && !self.contains(candidate))
            .ok_or(HubError::IdAllocation {
                attempts: MAX_ID_ATTEMPTS,
            })
    }

    /// Register a peer at the end of the join order.
    ///
    /// # Errors
    ///
    /// Returns `HubError::AlreadyJoined` if the connection already has a peer
    /// and `HubError::Internal` if the id is taken. An existing entry is
    /// never overwritten.
    pub fn insert(&mut self, peer: Peer) -> Result<(), HubError> {
        if self.by_connection.contains_key(peer.connection_id()) {
            return Err(HubError::AlreadyJoined);
        }
        if self.peers.contains_key(&peer.id) {
            return Err(HubError::Internal(format!(
                "peer id {} already registered",
                peer.id
            )));
        }

        self.by_connection
            .insert(peer.connection_id().to_string(), peer.id.clone());
        self.order.push(peer.id.clone());
        self.peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    /// Remove the peer bound to a connection, if any.
    pub fn remove_by_connection(&mut self, connection_id: &str) -> Option<Peer> {
        let peer_id = self.by_connection.remove(connection_id)?;
        self.order.retain(|id| id != &peer_id);
        self.peers.remove(&peer_id)
    }

    /// Set one media flag. Returns false if the peer is unknown.
    pub fn set_media(&mut self, peer_id: &str, kind: MediaKind, enabled: bool) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                match kind {
                    MediaKind::Audio => peer.audio_enabled = enabled,
                    MediaKind::Video => peer.video_enabled = enabled,
                }
                true
            }
            None => false,
        }
    }

    /// Peers in join order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.order.iter().filter_map(|id| self.peers.get(id))
    }

    #[must_use]
    pub fn users(&self) -> Vec<UserEntry> {
        self.iter()
            .map(|p| UserEntry {
                user_id: p.id.clone(),
                username: p.display_name.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn audio_states(&self) -> Vec<AudioState> {
        self.iter()
            .map(|p| AudioState {
                user_id: p.id.clone(),
                is_audio_enabled: p.audio_enabled,
            })
            .collect()
    }

    #[must_use]
    pub fn video_states(&self) -> Vec<VideoState> {
        self.iter()
            .map(|p| VideoState {
                user_id: p.id.clone(),
                is_video_enabled: p.video_enabled,
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Replays a fixed list of ids.
    struct ScriptedIds(VecDeque<String>);

    impl IdGenerator for ScriptedIds {
        fn generate(&mut self) -> String {
            self.0.pop_front().unwrap_or_default()
        }
    }

    fn scripted(ids: &[&str]) -> ScriptedIds {
        ScriptedIds(ids.iter().map(|s| (*s).to_string()).collect())
    }

    fn peer(id: &str, name: &str, connection_id: &str) -> Peer {
        let (sender, _receiver) = mpsc::channel(1);
        let handle = ConnectionActorHandle::new(
            connection_id.to_string(),
            sender,
            CancellationToken::new(),
        );
        Peer::new(id.to_string(), name.to_string(), handle)
    }

    #[test]
    fn test_random_ids_are_base36() {
        let mut generator = RandomIdGenerator;
        for _ in 0..100 {
            let id = generator.generate();
            assert_eq!(id.len(), PEER_ID_LEN);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn test_join_order_preserved_across_removal() {
        let mut registry = Registry::new();
        registry.insert(peer("a", "alice", "c1")).unwrap();
        registry.insert(peer("b", "bob", "c2")).unwrap();
        registry.insert(peer("c", "carol", "c3")).unwrap();

        let removed = registry.remove_by_connection("c2").unwrap();
        assert_eq!(removed.id, "b");

        let ids: Vec<_> = registry.users().into_iter().map(|u| u.user_id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(registry.peer_for_connection("c2").is_none());
    }

    #[test]
    fn test_insert_never_overwrites() {
        let mut registry = Registry::new();
        registry.insert(peer("a", "alice", "c1")).unwrap();

        assert!(matches!(
            registry.insert(peer("z", "again", "c1")),
            Err(HubError::AlreadyJoined)
        ));
        assert!(matches!(
            registry.insert(peer("a", "imposter", "c9")),
            Err(HubError::Internal(_))
        ));
        assert_eq!(registry.get("a").unwrap().display_name, "alice");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_allocate_id_retries_on_collision() {
        let mut registry = Registry::new();
        registry.insert(peer("taken", "alice", "c1")).unwrap();

        let mut generator = scripted(&["taken", "taken", "fresh"]);
        assert_eq!(registry.allocate_id(&mut generator).unwrap(), "fresh");
    }

    #[test]
    fn test_allocate_id_gives_up() {
        let mut registry = Registry::new();
        registry.insert(peer("taken", "alice", "c1")).unwrap();

        let ids = vec!["taken"; MAX_ID_ATTEMPTS + 1];
        let mut generator = scripted(&ids);
        assert!(matches!(
            registry.allocate_id(&mut generator),
            Err(HubError::IdAllocation { attempts: MAX_ID_ATTEMPTS })
        ));
    }

    #[test]
    fn test_media_flags_default_off_and_update() {
        let mut registry = Registry::new();
        registry.insert(peer("a", "alice", "c1")).unwrap();

        assert!(!registry.audio_states()[0].is_audio_enabled);
        assert!(registry.set_media("a", MediaKind::Audio, true));
        assert!(!registry.set_media("ghost", MediaKind::Audio, true));

        assert!(registry.audio_states()[0].is_audio_enabled);
        assert!(!registry.video_states()[0].is_video_enabled);
    }
}

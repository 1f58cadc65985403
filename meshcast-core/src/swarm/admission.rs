//! Peer admission: racing connections for one peer id settle on a single
//! winner.
//!
//! Every discovered connection starts as a candidate. The first candidate of
//! a peer id to open wins; its siblings are handed back to be closed.

use std::collections::HashMap;

use super::{ConnectionId, PeerId};

/// Result of a connection opening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The connection became the peer's link; `losers` must be closed
    Admitted {
        peer_id: PeerId,
        losers: Vec<ConnectionId>,
    },
    /// The peer already has a link; this connection must be closed
    Duplicate { peer_id: PeerId },
    /// The connection was never discovered or was already discarded
    Unknown,
}

/// Result of a connection closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The peer's live link closed
    Connected { peer_id: PeerId },
    /// A pending candidate went away
    Candidate { peer_id: PeerId },
    Unknown,
}

/// Admission state keyed by peer id.
#[derive(Debug, Default)]
pub struct PeerAdmission {
    owners: HashMap<ConnectionId, PeerId>,
    candidates: HashMap<PeerId, Vec<ConnectionId>>,
    connected: HashMap<PeerId, ConnectionId>,
}

impl PeerAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a discovered connection as a candidate.
    ///
    /// Returns false if the peer is already connected; the connection must
    /// then be closed.
    pub fn discover(&mut self, connection: ConnectionId, peer_id: PeerId) -> bool {
        if self.connected.contains_key(&peer_id) {
            return false;
        }

        self.owners.insert(connection, peer_id);
        self.candidates.entry(peer_id).or_default().push(connection);
        true
    }

    /// Settles a connection that finished opening.
    pub fn connect(&mut self, connection: ConnectionId) -> ConnectOutcome {
        let Some(&peer_id) = self.owners.get(&connection) else {
            return ConnectOutcome::Unknown;
        };

        if self.connected.contains_key(&peer_id) {
            self.forget_candidate(connection, peer_id);
            return ConnectOutcome::Duplicate { peer_id };
        }

        let losers: Vec<ConnectionId> = self
            .candidates
            .remove(&peer_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|candidate| *candidate != connection)
            .collect();
        for loser in &losers {
            self.owners.remove(loser);
        }

        self.connected.insert(peer_id, connection);
        ConnectOutcome::Admitted { peer_id, losers }
    }

    /// Forgets a connection that closed.
    pub fn close(&mut self, connection: ConnectionId) -> CloseOutcome {
        let Some(peer_id) = self.owners.remove(&connection) else {
            return CloseOutcome::Unknown;
        };

        if self.connected.get(&peer_id) == Some(&connection) {
            self.connected.remove(&peer_id);
            return CloseOutcome::Connected { peer_id };
        }

        self.forget_candidate(connection, peer_id);
        CloseOutcome::Candidate { peer_id }
    }

    /// Peer owning `connection`, only if it is that peer's live link.
    pub fn connected_peer(&self, connection: ConnectionId) -> Option<PeerId> {
        let peer_id = self.owners.get(&connection)?;
        (self.connected.get(peer_id) == Some(&connection)).then_some(*peer_id)
    }

    /// Live link of a connected peer.
    pub fn connection_of(&self, peer_id: &PeerId) -> Option<ConnectionId> {
        self.connected.get(peer_id).copied()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// Forgets everything and returns every known connection.
    pub fn clear(&mut self) -> Vec<ConnectionId> {
        let mut connections: Vec<ConnectionId> = self.owners.keys().copied().collect();
        connections.sort();
        self.owners.clear();
        self.candidates.clear();
        self.connected.clear();
        connections
    }

    fn forget_candidate(&mut self, connection: ConnectionId, peer_id: PeerId) {
        self.owners.remove(&connection);
        if let Some(pending) = self.candidates.get_mut(&peer_id) {
            pending.retain(|candidate| *candidate != connection);
            if pending.is_empty() {
                self.candidates.remove(&peer_id);
            }
        }
    }
}

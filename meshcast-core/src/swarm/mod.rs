//! Swarm membership and peer transport seam.
//!
//! The coordinator drives tracker announces and peer links through the
//! `SwarmTransport` trait and consumes `SwarmEvent`s produced by it. Actual
//! ICE/SDP negotiation and tracker sockets live behind that trait.

pub mod admission;
pub mod coordinator;

use std::fmt;

use bytes::Bytes;
use sha1::{Digest, Sha1};

pub use admission::{CloseOutcome, ConnectOutcome, PeerAdmission};
pub use coordinator::{SwarmCoordinator, SwarmNotice};

use crate::error::TransportError;
use crate::protocol::PROTOCOL_VERSION;
use crate::random::RandomSource;

/// Client prefix of generated peer ids.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-WW0006-";

const PEER_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// 20-byte peer identifier, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Generates a client-prefixed id with 12 random alphanumerics.
    pub fn generate(random: &mut dyn RandomSource) -> Self {
        let mut bytes = [0u8; 20];
        bytes[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        for byte in &mut bytes[PEER_ID_PREFIX.len()..] {
            *byte = PEER_ID_ALPHABET[random.next_index(PEER_ID_ALPHABET.len())];
        }
        Self(bytes)
    }

    /// Parses a 40-character hex id received from a tracker.
    pub fn from_hex(hex_id: &str) -> Option<Self> {
        let decoded = hex::decode(hex_id).ok()?;
        let bytes: [u8; 20] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Tracker-level swarm identifier: SHA-1 of protocol version and stream
/// swarm id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwarmId([u8; 20]);

impl SwarmId {
    pub fn for_stream(stream_swarm_id: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(PROTOCOL_VERSION.as_bytes());
        hasher.update(stream_swarm_id.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwarmId({self})")
    }
}

/// Transport-level handle of one peer link.
///
/// Several connections may race for the same peer id; only one survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Parameters of a tracker announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub swarm_id: SwarmId,
    pub peer_id: PeerId,
    pub announce_urls: Vec<String>,
    /// Peers requested from each tracker
    pub num_want: usize,
    pub ice_servers: Vec<String>,
}

/// How to leave a swarm's tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerTeardown {
    /// Stop announcing but keep the tracker socket for the next swarm
    Soft,
    /// Close the tracker socket as well
    Hard,
}

/// Events produced by the swarm transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// A tracker offered a peer; the link is still negotiating
    PeerDiscovered {
        connection: ConnectionId,
        /// Hex-encoded remote peer id
        peer_id: String,
    },
    /// The data channel of a link opened
    PeerConnected {
        connection: ConnectionId,
        remote_address: Option<String>,
    },
    /// One frame arrived on a link
    PeerData {
        connection: ConnectionId,
        frame: Bytes,
    },
    /// A link closed
    PeerClosed { connection: ConnectionId },
    /// A link reported an error; a close usually follows
    PeerError {
        connection: ConnectionId,
        reason: String,
    },
    /// Tracker statistics for a swarm
    TrackerUpdate {
        swarm_id: SwarmId,
        incomplete: Option<u32>,
    },
    TrackerWarning { reason: String },
    TrackerError { reason: String },
}

/// Peer connection and tracker layer.
///
/// Calls never block; results of asynchronous work come back as
/// `SwarmEvent`s on the channel the transport was created with.
pub trait SwarmTransport: Send + Sync {
    /// Starts announcing to the trackers of a swarm.
    ///
    /// # Errors
    ///
    /// - `TransportError::Network` - If no tracker could be contacted
    fn announce(&self, request: AnnounceRequest) -> Result<(), TransportError>;

    /// Stops announcing a swarm.
    fn stop_announce(&self, swarm_id: SwarmId, teardown: TrackerTeardown);

    /// Writes one frame to a link, preserving order per link.
    ///
    /// # Errors
    ///
    /// - `TransportError::ChannelClosed` - If the link is no longer open
    fn send(&self, connection: ConnectionId, frame: Bytes) -> Result<(), TransportError>;

    /// Closes a link. Closing an unknown link is a no-op.
    fn close(&self, connection: ConnectionId);
}

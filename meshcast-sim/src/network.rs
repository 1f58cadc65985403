//! Simulated peer network with tracker rooms.
//!
//! Every `SimulatedSwarmTransport` is one node. Announcing joins the swarm's
//! room and pairs the newcomer with existing members through a link made of
//! two connection ids, one per end. Frames written on one end arrive on the
//! other in order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use meshcast_core::TransportError;
use meshcast_core::swarm::{
    AnnounceRequest, ConnectionId, PeerId, SwarmEvent, SwarmId, SwarmTransport, TrackerTeardown,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

type NodeId = usize;

/// Behavior knobs of the simulated network.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkConfig {
    /// Offer every pairing twice so both ends race two candidates
    pub duplicate_candidates: bool,
}

#[derive(Debug)]
struct Node {
    events: mpsc::UnboundedSender<SwarmEvent>,
    peer_id: Option<PeerId>,
    /// Whether the tracker socket is still open
    tracker_open: bool,
}

#[derive(Debug, Clone, Copy)]
struct LinkEnd {
    owner: NodeId,
    remote: ConnectionId,
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: Vec<Node>,
    rooms: HashMap<SwarmId, Vec<NodeId>>,
    links: HashMap<ConnectionId, LinkEnd>,
    next_connection: u64,
    frames_delivered: u64,
    bytes_delivered: u64,
}

impl NetworkState {
    fn emit(&self, node: NodeId, event: SwarmEvent) {
        if let Some(node) = self.nodes.get(node) {
            let _ = node.events.send(event);
        }
    }

    fn next_connection(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId(self.next_connection)
    }

    fn linked(&self, a: NodeId, b: NodeId) -> bool {
        self.links
            .values()
            .any(|end| end.owner == a && self.links.get(&end.remote).is_some_and(|far| far.owner == b))
    }

    /// Creates a link between two nodes and announces it to both ends.
    fn pair(&mut self, newcomer: NodeId, member: NodeId) {
        let (Some(newcomer_id), Some(member_id)) = (
            self.nodes[newcomer].peer_id,
            self.nodes[member].peer_id,
        ) else {
            return;
        };

        let near = self.next_connection();
        let far = self.next_connection();
        self.links.insert(
            near,
            LinkEnd {
                owner: newcomer,
                remote: far,
            },
        );
        self.links.insert(
            far,
            LinkEnd {
                owner: member,
                remote: near,
            },
        );

        self.emit(
            newcomer,
            SwarmEvent::PeerDiscovered {
                connection: near,
                peer_id: member_id.to_string(),
            },
        );
        self.emit(
            member,
            SwarmEvent::PeerDiscovered {
                connection: far,
                peer_id: newcomer_id.to_string(),
            },
        );
        self.emit(
            newcomer,
            SwarmEvent::PeerConnected {
                connection: near,
                remote_address: Some(format!("sim-node-{member}")),
            },
        );
        self.emit(
            member,
            SwarmEvent::PeerConnected {
                connection: far,
                remote_address: Some(format!("sim-node-{newcomer}")),
            },
        );
    }

    /// Removes both ends of a link. The far end is told it closed.
    fn unlink(&mut self, connection: ConnectionId) {
        let Some(end) = self.links.remove(&connection) else {
            return;
        };
        if let Some(far) = self.links.remove(&end.remote) {
            self.emit(far.owner, SwarmEvent::PeerClosed { connection: end.remote });
        }
    }

    fn leave_room(&mut self, node: NodeId, swarm_id: SwarmId) {
        if let Some(members) = self.rooms.get_mut(&swarm_id) {
            members.retain(|member| *member != node);
            let remaining = members.len();
            let members = members.clone();
            for member in members {
                self.emit(
                    member,
                    SwarmEvent::TrackerUpdate {
                        swarm_id,
                        incomplete: Some(remaining as u32),
                    },
                );
            }
        }
    }
}

/// Shared in-process network. Cloning yields another handle to the same
/// network.
#[derive(Debug, Clone, Default)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    state: Arc<Mutex<NetworkState>>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(NetworkState::default())),
        }
    }

    /// Adds a node and returns its transport and event channel.
    pub fn join(&self) -> (SimulatedSwarmTransport, mpsc::UnboundedReceiver<SwarmEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.nodes.push(Node {
            events,
            peer_id: None,
            tracker_open: false,
        });
        let node = state.nodes.len() - 1;

        let transport = SimulatedSwarmTransport {
            node,
            config: self.config,
            state: Arc::clone(&self.state),
        };
        (transport, receiver)
    }

    /// Members of a swarm's room, in join order.
    pub fn room_size(&self, swarm_id: &SwarmId) -> usize {
        self.state
            .lock()
            .rooms
            .get(swarm_id)
            .map_or(0, Vec::len)
    }

    /// Connection ends currently open.
    pub fn open_links(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.state.lock().frames_delivered
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.state.lock().bytes_delivered
    }
}

/// One node of a `SimulatedNetwork`.
#[derive(Debug, Clone)]
pub struct SimulatedSwarmTransport {
    node: NodeId,
    config: NetworkConfig,
    state: Arc<Mutex<NetworkState>>,
}

impl SimulatedSwarmTransport {
    /// Whether this node still holds a tracker socket.
    pub fn tracker_open(&self) -> bool {
        self.state
            .lock()
            .nodes
            .get(self.node)
            .is_some_and(|node| node.tracker_open)
    }
}

impl SwarmTransport for SimulatedSwarmTransport {
    fn announce(&self, request: AnnounceRequest) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let node = self.node;
        state.nodes[node].peer_id = Some(request.peer_id);
        state.nodes[node].tracker_open = true;

        let members = state.rooms.entry(request.swarm_id).or_default();
        if members.contains(&node) {
            return Ok(());
        }
        let existing: Vec<NodeId> = members.clone();
        members.push(node);
        let room_size = members.len();
        let members = members.clone();

        tracing::debug!(
            node,
            swarm_id = %request.swarm_id,
            room_size,
            "Simulated announce"
        );

        let offered: Vec<NodeId> = existing
            .into_iter()
            .filter(|member| !state.linked(node, *member))
            .take(request.num_want)
            .collect();
        for member in offered {
            state.pair(node, member);
            if self.config.duplicate_candidates {
                state.pair(node, member);
            }
        }

        for member in members {
            state.emit(
                member,
                SwarmEvent::TrackerUpdate {
                    swarm_id: request.swarm_id,
                    incomplete: Some(room_size as u32),
                },
            );
        }
        Ok(())
    }

    fn stop_announce(&self, swarm_id: SwarmId, teardown: TrackerTeardown) {
        let mut state = self.state.lock();
        state.leave_room(self.node, swarm_id);

        if teardown == TrackerTeardown::Hard {
            state.nodes[self.node].tracker_open = false;
            let own: Vec<ConnectionId> = state
                .links
                .iter()
                .filter(|(_, end)| end.owner == self.node)
                .map(|(connection, _)| *connection)
                .collect();
            for connection in own {
                state.unlink(connection);
            }
        }
    }

    fn send(&self, connection: ConnectionId, frame: Bytes) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let Some(end) = state.links.get(&connection).copied() else {
            return Err(TransportError::ChannelClosed {
                reason: format!("{connection} is not open"),
            });
        };
        let Some(far) = state.links.get(&end.remote).copied() else {
            return Err(TransportError::ChannelClosed {
                reason: format!("{connection} lost its remote end"),
            });
        };

        state.frames_delivered += 1;
        state.bytes_delivered += frame.len() as u64;
        state.emit(
            far.owner,
            SwarmEvent::PeerData {
                connection: end.remote,
                frame,
            },
        );
        Ok(())
    }

    fn close(&self, connection: ConnectionId) {
        self.state.lock().unlink(connection);
    }
}

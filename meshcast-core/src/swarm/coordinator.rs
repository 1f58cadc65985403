//! Swarm coordination: tracker lifecycle, peer sessions, request routing and
//! availability aggregation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use super::admission::{CloseOutcome, ConnectOutcome, PeerAdmission};
use super::{
    AnnounceRequest, ConnectionId, PeerId, SwarmEvent, SwarmId, SwarmTransport, TrackerTeardown,
};
use crate::clock::SharedClock;
use crate::config::{LoaderConfig, P2pConfig, TrackerConfig};
use crate::error::{SegmentError, TransportError};
use crate::protocol::{AvailabilityMap, FrameSink, PeerSession, SegmentsMapPayload, SessionEvent};
use crate::random::RandomSource;
use crate::segment::{DownloadMethod, Segment, SegmentId};
use crate::storage::SegmentsStorage;
use crate::validation::SegmentValidator;

/// Outcomes the scheduler reacts to.
#[derive(Debug, Clone)]
pub enum SwarmNotice {
    PeerConnected {
        peer_id: PeerId,
        remote_address: Option<String>,
    },
    PeerClosed {
        peer_id: PeerId,
    },
    /// Some peer's advertised availability changed
    AvailabilityChanged,
    SegmentLoaded {
        segment: Segment,
        data: Bytes,
        peer_id: PeerId,
    },
    SegmentFailed {
        segment: Segment,
        error: SegmentError,
        peer_id: PeerId,
    },
    BytesDownloaded {
        bytes: usize,
        peer_id: PeerId,
    },
    BytesUploaded {
        bytes: usize,
        peer_id: PeerId,
    },
    TrackerUpdate {
        incomplete: Option<u32>,
    },
}

#[derive(Debug, Clone)]
struct ActiveSwarm {
    swarm_id: SwarmId,
    stream_swarm_id: String,
    master_swarm_id: String,
}

/// An outstanding P2P fetch.
#[derive(Debug)]
struct PeerDownload {
    peer_id: PeerId,
    segment: Segment,
}

/// Writes session frames to one transport link.
struct ConnectionSink<'a> {
    transport: &'a dyn SwarmTransport,
    connection: ConnectionId,
}

impl FrameSink for ConnectionSink<'_> {
    fn send_frame(&mut self, frame: Bytes) {
        if let Err(e) = self.transport.send(self.connection, frame) {
            tracing::warn!(connection = %self.connection, error = %e, "Failed to write peer frame");
        }
    }
}

/// Manages the peers of the current swarm.
pub struct SwarmCoordinator {
    transport: Arc<dyn SwarmTransport>,
    storage: Arc<dyn SegmentsStorage>,
    validator: Option<Arc<dyn SegmentValidator>>,
    p2p: P2pConfig,
    tracker: TrackerConfig,
    clock: SharedClock,
    peer_id: PeerId,
    swarm: Option<ActiveSwarm>,
    admission: PeerAdmission,
    sessions: HashMap<PeerId, PeerSession>,
    downloads: HashMap<SegmentId, PeerDownload>,
}

impl SwarmCoordinator {
    pub fn new(
        config: &LoaderConfig,
        peer_id: PeerId,
        transport: Arc<dyn SwarmTransport>,
        storage: Arc<dyn SegmentsStorage>,
        validator: Option<Arc<dyn SegmentValidator>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            transport,
            storage,
            validator,
            p2p: config.p2p.clone(),
            tracker: config.tracker.clone(),
            clock,
            peer_id,
            swarm: None,
            admission: PeerAdmission::new(),
            sessions: HashMap::new(),
            downloads: HashMap::new(),
        }
    }

    /// Local peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Tracker id of the current swarm.
    pub fn swarm_id(&self) -> Option<SwarmId> {
        self.swarm.as_ref().map(|swarm| swarm.swarm_id)
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    /// Switches to the swarm of `stream_swarm_id`.
    ///
    /// Leaving the previous swarm drops all its peers and pending requests.
    pub fn set_swarm(&mut self, stream_swarm_id: &str, master_swarm_id: &str) {
        if self
            .swarm
            .as_ref()
            .is_some_and(|swarm| swarm.stream_swarm_id == stream_swarm_id)
        {
            return;
        }

        let teardown = if self.tracker.reuse_connection_on_swarm_change {
            TrackerTeardown::Soft
        } else {
            TrackerTeardown::Hard
        };
        self.leave_swarm(teardown);

        let swarm_id = SwarmId::for_stream(stream_swarm_id);
        self.swarm = Some(ActiveSwarm {
            swarm_id,
            stream_swarm_id: stream_swarm_id.to_string(),
            master_swarm_id: master_swarm_id.to_string(),
        });

        if !self.p2p.enabled {
            return;
        }

        tracing::info!(%swarm_id, stream_swarm_id, peer_id = %self.peer_id, "Joining swarm");
        let request = AnnounceRequest {
            swarm_id,
            peer_id: self.peer_id,
            announce_urls: self.tracker.announce_urls.clone(),
            num_want: self.tracker.peer_requests_per_announce,
            ice_servers: self.p2p.ice_servers.clone(),
        };
        if let Err(e) = self.transport.announce(request) {
            tracing::warn!(%swarm_id, error = %e, "Tracker announce failed");
        }
    }

    /// Requests a segment from a random idle peer that holds it.
    ///
    /// Returns false when no peer can serve it right now.
    pub fn download(&mut self, segment: &Segment, random: &mut dyn RandomSource) -> bool {
        if self.downloads.contains_key(&segment.id) {
            return false;
        }

        let mut candidates: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|session| session.is_idle() && session.availability().is_loaded(&segment.id))
            .map(PeerSession::peer_id)
            .collect();
        if candidates.is_empty() {
            return false;
        }
        // Stable order keeps seeded runs reproducible
        candidates.sort();

        let peer_id = candidates[random.next_index(candidates.len())];
        let Some(connection) = self.admission.connection_of(&peer_id) else {
            return false;
        };
        let Some(session) = self.sessions.get_mut(&peer_id) else {
            return false;
        };

        let mut sink = ConnectionSink {
            transport: self.transport.as_ref(),
            connection,
        };
        if let Err(e) = session.request_segment(segment.id.clone(), self.clock.now(), &mut sink) {
            tracing::warn!(%peer_id, segment_id = %segment.id, error = %e, "Peer request rejected");
            return false;
        }

        tracing::debug!(%peer_id, segment_id = %segment.id, "Started P2P download");
        self.downloads.insert(
            segment.id.clone(),
            PeerDownload {
                peer_id,
                segment: segment.clone(),
            },
        );
        true
    }

    /// Cancels the P2P download of a segment.
    ///
    /// Returns the payload chunks received so far, if any.
    pub fn abort(&mut self, segment_id: &SegmentId) -> Option<Vec<Bytes>> {
        let download = self.downloads.remove(segment_id)?;
        let connection = self.admission.connection_of(&download.peer_id)?;
        let session = self.sessions.get_mut(&download.peer_id)?;

        tracing::debug!(peer_id = %download.peer_id, %segment_id, "Aborting P2P download");
        let mut sink = ConnectionSink {
            transport: self.transport.as_ref(),
            connection,
        };
        session.cancel_segment_request(&mut sink)
    }

    /// Bytes delivered so far for a P2P download, leaving it running.
    pub fn partial_data(&self, segment_id: &SegmentId) -> Option<Vec<Bytes>> {
        let download = self.downloads.get(segment_id)?;
        let chunks = self.sessions.get(&download.peer_id)?.received_chunks()?;
        Some(chunks.to_vec())
    }

    pub fn is_downloading(&self, segment_id: &SegmentId) -> bool {
        self.downloads.contains_key(segment_id)
    }

    pub fn active_downloads_count(&self) -> usize {
        self.downloads.len()
    }

    /// Swarm-wide availability: `Loaded` on any peer wins over
    /// `LoadingByHttp`.
    pub fn overall_availability(&self) -> AvailabilityMap {
        let mut overall = AvailabilityMap::new();
        for session in self.sessions.values() {
            for (id, status) in session.availability().iter() {
                overall.merge(id, status);
            }
        }
        overall
    }

    /// Sends the local availability map to one peer.
    pub fn send_segments_map(&self, peer_id: &PeerId, map: &SegmentsMapPayload) {
        let (Some(connection), Some(session)) =
            (self.admission.connection_of(peer_id), self.sessions.get(peer_id))
        else {
            return;
        };

        let mut sink = ConnectionSink {
            transport: self.transport.as_ref(),
            connection,
        };
        session.send_segments_map(map, &mut sink);
    }

    /// Sends the local availability map to every connected peer.
    pub fn send_segments_map_to_all(&self, map: &SegmentsMapPayload) {
        for (peer_id, session) in &self.sessions {
            let Some(connection) = self.admission.connection_of(peer_id) else {
                continue;
            };
            let mut sink = ConnectionSink {
                transport: self.transport.as_ref(),
                connection,
            };
            session.send_segments_map(map, &mut sink);
        }
    }

    /// Earliest pending response deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions.values().filter_map(PeerSession::deadline).min()
    }

    /// Expires requests whose peers did not answer in time.
    ///
    /// Unresponsive peers are dropped.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<SwarmNotice> {
        let mut expired: Vec<(PeerId, SegmentId)> = self
            .sessions
            .iter_mut()
            .filter_map(|(peer_id, session)| {
                session
                    .poll_timeout(now)
                    .map(|segment_id| (*peer_id, segment_id))
            })
            .collect();
        expired.sort();

        let mut notices = Vec::new();
        for (peer_id, segment_id) in expired {
            tracing::warn!(%peer_id, %segment_id, "Peer did not respond in time, dropping it");
            if let Some(download) = self.take_download(&segment_id, &peer_id) {
                notices.push(SwarmNotice::SegmentFailed {
                    segment: download.segment,
                    error: SegmentError::Timeout {
                        peer_id,
                        timeout: self.p2p.segment_download_timeout,
                    },
                    peer_id,
                });
            }
            self.drop_peer(peer_id, &mut notices);
        }
        notices
    }

    /// Applies one transport event.
    pub async fn handle_event(&mut self, event: SwarmEvent) -> Vec<SwarmNotice> {
        let mut notices = Vec::new();

        match event {
            SwarmEvent::PeerDiscovered {
                connection,
                peer_id,
            } => self.on_peer_discovered(connection, &peer_id),
            SwarmEvent::PeerConnected {
                connection,
                remote_address,
            } => self.on_peer_connected(connection, remote_address, &mut notices),
            SwarmEvent::PeerData { connection, frame } => {
                self.on_peer_data(connection, frame, &mut notices).await;
            }
            SwarmEvent::PeerClosed { connection } => self.on_peer_closed(connection, &mut notices),
            SwarmEvent::PeerError { connection, reason } => {
                tracing::debug!(%connection, reason, "Peer link error");
            }
            SwarmEvent::TrackerUpdate {
                swarm_id,
                incomplete,
            } => {
                if self.swarm_id() == Some(swarm_id) {
                    tracing::debug!(%swarm_id, ?incomplete, "Tracker update");
                    notices.push(SwarmNotice::TrackerUpdate { incomplete });
                }
            }
            SwarmEvent::TrackerWarning { reason } => tracing::warn!(reason, "Tracker warning"),
            SwarmEvent::TrackerError { reason } => tracing::warn!(reason, "Tracker error"),
        }

        notices
    }

    /// Leaves the swarm, closing every link and the tracker socket.
    pub fn destroy(&mut self) {
        self.leave_swarm(TrackerTeardown::Hard);
    }

    fn leave_swarm(&mut self, teardown: TrackerTeardown) {
        let Some(swarm) = self.swarm.take() else {
            return;
        };

        tracing::info!(swarm_id = %swarm.swarm_id, ?teardown, "Leaving swarm");
        if self.p2p.enabled {
            self.transport.stop_announce(swarm.swarm_id, teardown);
        }
        for connection in self.admission.clear() {
            self.transport.close(connection);
        }
        self.sessions.clear();
        self.downloads.clear();
    }

    fn on_peer_discovered(&mut self, connection: ConnectionId, hex_peer_id: &str) {
        if self.swarm.is_none() {
            self.transport.close(connection);
            return;
        }

        let Some(peer_id) = PeerId::from_hex(hex_peer_id) else {
            tracing::warn!(%connection, hex_peer_id, "Rejecting peer with invalid id");
            self.transport.close(connection);
            return;
        };

        if peer_id == self.peer_id {
            self.transport.close(connection);
            return;
        }

        if !self.admission.discover(connection, peer_id) {
            tracing::debug!(%connection, %peer_id, "Rejecting connection to already connected peer");
            self.transport.close(connection);
        }
    }

    fn on_peer_connected(
        &mut self,
        connection: ConnectionId,
        remote_address: Option<String>,
        notices: &mut Vec<SwarmNotice>,
    ) {
        match self.admission.connect(connection) {
            ConnectOutcome::Admitted { peer_id, losers } => {
                for loser in losers {
                    tracing::debug!(%peer_id, connection = %loser, "Discarding losing candidate");
                    self.transport.close(loser);
                }

                tracing::debug!(%peer_id, %connection, ?remote_address, "Peer connected");
                self.sessions.insert(
                    peer_id,
                    PeerSession::new(
                        peer_id,
                        remote_address.clone(),
                        self.p2p.segment_download_timeout,
                        self.p2p.max_message_size,
                    ),
                );
                notices.push(SwarmNotice::PeerConnected {
                    peer_id,
                    remote_address,
                });
            }
            ConnectOutcome::Duplicate { peer_id } => {
                tracing::debug!(%peer_id, %connection, "Closing duplicate connection");
                self.transport.close(connection);
            }
            ConnectOutcome::Unknown => self.transport.close(connection),
        }
    }

    async fn on_peer_data(
        &mut self,
        connection: ConnectionId,
        frame: Bytes,
        notices: &mut Vec<SwarmNotice>,
    ) {
        let Some(peer_id) = self.admission.connected_peer(connection) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&peer_id) else {
            return;
        };

        for event in session.receive_frame(frame) {
            match event {
                SessionEvent::AvailabilityUpdated => notices.push(SwarmNotice::AvailabilityChanged),
                SessionEvent::SegmentRequested { segment_id } => {
                    self.serve_segment(peer_id, connection, segment_id, notices)
                        .await;
                }
                SessionEvent::RequestCancelled { segment_id } => {
                    // Payload is written synchronously, nothing left to stop
                    tracing::trace!(%peer_id, %segment_id, "Peer cancelled its request");
                }
                SessionEvent::SegmentLoaded { segment_id, data } => {
                    self.on_segment_loaded(peer_id, segment_id, data, notices);
                }
                SessionEvent::SegmentAbsent { segment_id } => {
                    if self.take_download(&segment_id, &peer_id).is_some() {
                        tracing::debug!(%peer_id, %segment_id, "Peer reported segment absent");
                    }
                    notices.push(SwarmNotice::AvailabilityChanged);
                }
                SessionEvent::TransferFailed { segment_id, error } => {
                    tracing::warn!(%peer_id, %segment_id, %error, "Peer transfer failed");
                    if let Some(download) = self.take_download(&segment_id, &peer_id) {
                        notices.push(SwarmNotice::SegmentFailed {
                            segment: download.segment,
                            error: SegmentError::Protocol(error),
                            peer_id,
                        });
                    }
                }
                SessionEvent::BytesReceived { bytes } => {
                    notices.push(SwarmNotice::BytesDownloaded { bytes, peer_id });
                }
                SessionEvent::InvalidCommand { .. } => {}
            }
        }
    }

    async fn serve_segment(
        &mut self,
        peer_id: PeerId,
        connection: ConnectionId,
        segment_id: SegmentId,
        notices: &mut Vec<SwarmNotice>,
    ) {
        let Some(swarm) = &self.swarm else {
            return;
        };

        let stored = match self.storage.segment(&segment_id, &swarm.master_swarm_id).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(%segment_id, error = %e, "Storage lookup for peer request failed");
                None
            }
        };

        // The peer may have gone away while storage was consulted
        let Some(session) = self.sessions.get(&peer_id) else {
            return;
        };
        let mut sink = ConnectionSink {
            transport: self.transport.as_ref(),
            connection,
        };

        match stored.and_then(|segment| segment.data) {
            Some(data) => {
                tracing::debug!(%peer_id, %segment_id, bytes = data.len(), "Serving segment to peer");
                session.send_segment_data(segment_id, &data, &mut sink);
                notices.push(SwarmNotice::BytesUploaded {
                    bytes: data.len(),
                    peer_id,
                });
            }
            None => session.send_segment_absent(segment_id, &mut sink),
        }
    }

    fn on_segment_loaded(
        &mut self,
        peer_id: PeerId,
        segment_id: SegmentId,
        data: Bytes,
        notices: &mut Vec<SwarmNotice>,
    ) {
        let Some(download) = self.take_download(&segment_id, &peer_id) else {
            return;
        };

        if let Some(validator) = &self.validator {
            if let Err(error) =
                validator.validate(&download.segment, &data, DownloadMethod::P2p, Some(&peer_id))
            {
                tracing::warn!(%peer_id, %segment_id, %error, "Peer sent invalid segment, dropping it");
                notices.push(SwarmNotice::SegmentFailed {
                    segment: download.segment,
                    error: SegmentError::Validation(error),
                    peer_id,
                });
                self.drop_peer(peer_id, notices);
                return;
            }
        }

        tracing::debug!(%peer_id, %segment_id, bytes = data.len(), "P2P download complete");
        notices.push(SwarmNotice::SegmentLoaded {
            segment: download.segment,
            data,
            peer_id,
        });
    }

    fn on_peer_closed(&mut self, connection: ConnectionId, notices: &mut Vec<SwarmNotice>) {
        match self.admission.close(connection) {
            CloseOutcome::Connected { peer_id } => {
                tracing::debug!(%peer_id, %connection, "Peer closed");
                self.forget_peer(peer_id, notices);
            }
            CloseOutcome::Candidate { peer_id } => {
                tracing::trace!(%peer_id, %connection, "Candidate closed");
            }
            CloseOutcome::Unknown => {}
        }
    }

    /// Closes a peer's link and forgets it immediately.
    fn drop_peer(&mut self, peer_id: PeerId, notices: &mut Vec<SwarmNotice>) {
        let Some(connection) = self.admission.connection_of(&peer_id) else {
            return;
        };
        self.admission.close(connection);
        self.transport.close(connection);
        self.forget_peer(peer_id, notices);
    }

    fn forget_peer(&mut self, peer_id: PeerId, notices: &mut Vec<SwarmNotice>) {
        self.sessions.remove(&peer_id);

        let mut orphaned: Vec<SegmentId> = self
            .downloads
            .iter()
            .filter(|(_, download)| download.peer_id == peer_id)
            .map(|(id, _)| id.clone())
            .collect();
        orphaned.sort();

        for segment_id in orphaned {
            if let Some(download) = self.downloads.remove(&segment_id) {
                notices.push(SwarmNotice::SegmentFailed {
                    segment: download.segment,
                    error: SegmentError::Transport(TransportError::PeerDisconnected { peer_id }),
                    peer_id,
                });
            }
        }

        notices.push(SwarmNotice::AvailabilityChanged);
        notices.push(SwarmNotice::PeerClosed { peer_id });
    }

    fn take_download(&mut self, segment_id: &SegmentId, peer_id: &PeerId) -> Option<PeerDownload> {
        match self.downloads.get(segment_id) {
            Some(download) if download.peer_id == *peer_id => self.downloads.remove(segment_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::PeerCommand;
    use crate::segment::SegmentStatus;
    use crate::storage::MemorySegmentsStorage;
    use crate::test_mocks::{MockSwarmTransport, ScriptedRandom, SwarmCall};
    use crate::validation::ValidationError;

    struct Fixture {
        coordinator: SwarmCoordinator,
        transport: MockSwarmTransport,
        storage: Arc<MemorySegmentsStorage>,
        clock: ManualClock,
    }

    fn fixture_with(validator: Option<Arc<dyn SegmentValidator>>) -> Fixture {
        let config = LoaderConfig::for_testing();
        let clock = ManualClock::new();
        let transport = MockSwarmTransport::new();
        let storage = Arc::new(MemorySegmentsStorage::new(
            config.cache.clone(),
            clock.shared(),
        ));
        let mut coordinator = SwarmCoordinator::new(
            &config,
            PeerId::new([0u8; 20]),
            Arc::new(transport.clone()),
            storage.clone(),
            validator,
            clock.shared(),
        );
        coordinator.set_swarm("master", "master");

        Fixture {
            coordinator,
            transport,
            storage,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn peer(byte: u8) -> PeerId {
        PeerId::new([byte; 20])
    }

    async fn connect(fixture: &mut Fixture, connection: u64, peer_id: PeerId) -> Vec<SwarmNotice> {
        fixture
            .coordinator
            .handle_event(SwarmEvent::PeerDiscovered {
                connection: ConnectionId(connection),
                peer_id: peer_id.to_string(),
            })
            .await;
        fixture
            .coordinator
            .handle_event(SwarmEvent::PeerConnected {
                connection: ConnectionId(connection),
                remote_address: Some(format!("10.0.0.{connection}:4000")),
            })
            .await
    }

    async fn advertise(fixture: &mut Fixture, connection: u64, sequences: &[&str]) {
        let mut map = SegmentsMapPayload::new();
        for sequence in sequences {
            map.push("master", sequence, SegmentStatus::Loaded);
        }
        fixture
            .coordinator
            .handle_event(SwarmEvent::PeerData {
                connection: ConnectionId(connection),
                frame: PeerCommand::SegmentsMap { map }.encode(),
            })
            .await;
    }

    async fn deliver(fixture: &mut Fixture, connection: u64, frame: Bytes) -> Vec<SwarmNotice> {
        fixture
            .coordinator
            .handle_event(SwarmEvent::PeerData {
                connection: ConnectionId(connection),
                frame,
            })
            .await
    }

    fn segment(sequence: &str) -> Segment {
        Segment::new("master", None, sequence, format!("http://origin/{sequence}.ts"))
    }

    fn data_header(segment_id: &str, size: usize) -> Bytes {
        PeerCommand::SegmentData {
            segment_id: SegmentId::new(segment_id),
            size,
        }
        .encode()
    }

    #[tokio::test]
    async fn test_set_swarm_announces_once() {
        let mut fixture = fixture();
        fixture.coordinator.set_swarm("master", "master");

        let announces = fixture
            .transport
            .calls()
            .into_iter()
            .filter(|call| matches!(call, SwarmCall::Announce(_)))
            .count();
        assert_eq!(announces, 1);

        fixture.coordinator.set_swarm("master+720p", "master");
        let calls = fixture.transport.calls();
        assert!(calls.contains(&SwarmCall::StopAnnounce(
            SwarmId::for_stream("master"),
            TrackerTeardown::Soft
        )));
        assert_eq!(
            fixture.coordinator.swarm_id(),
            Some(SwarmId::for_stream("master+720p"))
        );
    }

    #[tokio::test]
    async fn test_duplicate_candidates_settle_on_first_connect() {
        let mut fixture = fixture();
        for connection in [1, 2] {
            fixture
                .coordinator
                .handle_event(SwarmEvent::PeerDiscovered {
                    connection: ConnectionId(connection),
                    peer_id: peer(1).to_string(),
                })
                .await;
        }

        let notices = fixture
            .coordinator
            .handle_event(SwarmEvent::PeerConnected {
                connection: ConnectionId(2),
                remote_address: None,
            })
            .await;

        assert!(matches!(notices[0], SwarmNotice::PeerConnected { peer_id, .. } if peer_id == peer(1)));
        assert!(fixture.transport.calls().contains(&SwarmCall::Close(ConnectionId(1))));
        assert_eq!(fixture.coordinator.peer_count(), 1);

        // Rediscovering a connected peer is rejected
        fixture
            .coordinator
            .handle_event(SwarmEvent::PeerDiscovered {
                connection: ConnectionId(3),
                peer_id: peer(1).to_string(),
            })
            .await;
        assert!(fixture.transport.calls().contains(&SwarmCall::Close(ConnectionId(3))));
    }

    #[tokio::test]
    async fn test_download_requires_loaded_idle_peer() {
        let mut fixture = fixture();
        let mut random = ScriptedRandom::new(vec![], vec![0]);
        connect(&mut fixture, 1, peer(1)).await;

        assert!(!fixture.coordinator.download(&segment("1"), &mut random));

        advertise(&mut fixture, 1, &["1", "2"]).await;
        assert!(fixture.coordinator.download(&segment("1"), &mut random));
        assert!(fixture.coordinator.is_downloading(&SegmentId::new("master+1")));

        // The only peer is busy now
        assert!(!fixture.coordinator.download(&segment("2"), &mut random));
        assert_eq!(fixture.coordinator.active_downloads_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_segment_delivery_scenario() {
        let mut fixture = fixture();
        let mut random = ScriptedRandom::new(vec![], vec![0]);
        connect(&mut fixture, 1, peer(1)).await;
        advertise(&mut fixture, 1, &["S"]).await;

        assert!(fixture.coordinator.download(&segment("S"), &mut random));
        let request: serde_json::Value =
            serde_json::from_slice(&fixture.transport.sent_to(ConnectionId(1)).last().unwrap().clone())
                .unwrap();
        assert_eq!(request, serde_json::json!({ "c": 3, "i": "master+S" }));

        deliver(&mut fixture, 1, data_header("master+S", 1024)).await;
        deliver(&mut fixture, 1, Bytes::from(vec![5u8; 512])).await;
        let notices = deliver(&mut fixture, 1, Bytes::from(vec![6u8; 512])).await;

        let loaded = notices.iter().find_map(|notice| match notice {
            SwarmNotice::SegmentLoaded { data, peer_id, .. } => Some((data.len(), *peer_id)),
            _ => None,
        });
        assert_eq!(loaded, Some((1024, peer(1))));
        assert!(!fixture.coordinator.is_downloading(&SegmentId::new("master+S")));
    }

    #[tokio::test]
    async fn test_overrun_fails_download_without_dropping_peer() {
        let mut fixture = fixture();
        let mut random = ScriptedRandom::new(vec![], vec![0]);
        connect(&mut fixture, 1, peer(1)).await;
        advertise(&mut fixture, 1, &["S"]).await;
        fixture.coordinator.download(&segment("S"), &mut random);

        deliver(&mut fixture, 1, data_header("master+S", 4)).await;
        let notices = deliver(&mut fixture, 1, Bytes::from_static(b"12345")).await;

        assert!(notices.iter().any(|notice| matches!(
            notice,
            SwarmNotice::SegmentFailed { error: SegmentError::Protocol(_), .. }
        )));
        assert_eq!(fixture.coordinator.peer_count(), 1);
        assert_eq!(fixture.coordinator.active_downloads_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_returns_partial_bytes() {
        let mut fixture = fixture();
        let mut random = ScriptedRandom::new(vec![], vec![0]);
        connect(&mut fixture, 1, peer(1)).await;
        advertise(&mut fixture, 1, &["S"]).await;
        fixture.coordinator.download(&segment("S"), &mut random);
        deliver(&mut fixture, 1, data_header("master+S", 10)).await;
        deliver(&mut fixture, 1, Bytes::from_static(b"abcd")).await;

        let partial = fixture.coordinator.abort(&SegmentId::new("master+S"));

        assert_eq!(partial, Some(vec![Bytes::from_static(b"abcd")]));
        assert!(!fixture.coordinator.is_downloading(&SegmentId::new("master+S")));
        assert_eq!(fixture.coordinator.abort(&SegmentId::new("master+S")), None);
    }

    #[tokio::test]
    async fn test_overall_availability_prefers_loaded() {
        let mut fixture = fixture();
        connect(&mut fixture, 1, peer(1)).await;
        connect(&mut fixture, 2, peer(2)).await;

        let mut loading = SegmentsMapPayload::new();
        loading.push("master", "1", SegmentStatus::LoadingByHttp);
        loading.push("master", "2", SegmentStatus::LoadingByHttp);
        deliver(&mut fixture, 1, PeerCommand::SegmentsMap { map: loading }.encode()).await;
        advertise(&mut fixture, 2, &["1"]).await;

        let overall = fixture.coordinator.overall_availability();
        assert!(overall.is_loaded(&SegmentId::new("master+1")));
        assert_eq!(
            overall.status(&SegmentId::new("master+2")),
            Some(SegmentStatus::LoadingByHttp)
        );
        assert_eq!(overall.status(&SegmentId::new("master+3")), None);
    }

    #[tokio::test]
    async fn test_serves_stored_segment_or_absence() {
        let mut fixture = fixture();
        connect(&mut fixture, 1, peer(1)).await;

        let mut stored = segment("1");
        stored.data = Some(Bytes::from(vec![9u8; 10]));
        fixture.storage.store_segment(stored).await.unwrap();

        let request = |id: &str| {
            PeerCommand::SegmentRequest {
                segment_id: SegmentId::new(id),
            }
            .encode()
        };

        let notices = deliver(&mut fixture, 1, request("master+1")).await;
        assert!(matches!(
            notices[..],
            [SwarmNotice::BytesUploaded { bytes: 10, .. }]
        ));
        let sent = fixture.transport.sent_to(ConnectionId(1));
        assert_eq!(sent[sent.len() - 2], data_header("master+1", 10));
        assert_eq!(sent[sent.len() - 1].len(), 10);

        deliver(&mut fixture, 1, request("master+2")).await;
        let absent: serde_json::Value =
            serde_json::from_slice(fixture.transport.sent_to(ConnectionId(1)).last().unwrap())
                .unwrap();
        assert_eq!(absent, serde_json::json!({ "c": 1, "i": "master+2" }));
    }

    #[tokio::test]
    async fn test_timeout_drops_peer() {
        let mut fixture = fixture();
        let mut random = ScriptedRandom::new(vec![], vec![0]);
        connect(&mut fixture, 1, peer(1)).await;
        advertise(&mut fixture, 1, &["S"]).await;
        fixture.coordinator.download(&segment("S"), &mut random);

        let deadline = fixture.coordinator.next_deadline().unwrap();
        assert!(fixture.coordinator.poll_timeouts(deadline - Duration::from_millis(1)).is_empty());

        fixture.clock.advance(Duration::from_secs(60));
        let notices = fixture.coordinator.poll_timeouts(deadline);

        assert!(matches!(
            notices[0],
            SwarmNotice::SegmentFailed { error: SegmentError::Timeout { .. }, .. }
        ));
        assert!(matches!(notices.last(), Some(SwarmNotice::PeerClosed { .. })));
        assert_eq!(fixture.coordinator.peer_count(), 0);
        assert!(fixture.transport.calls().contains(&SwarmCall::Close(ConnectionId(1))));
    }

    #[tokio::test]
    async fn test_validator_rejection_drops_peer() {
        let validator: Arc<dyn SegmentValidator> = Arc::new(
            |segment: &Segment, _data: &Bytes, _method: DownloadMethod, _peer: Option<&PeerId>| {
                Err(ValidationError::new(segment.id.clone(), "bad checksum"))
            },
        );
        let mut fixture = fixture_with(Some(validator));
        let mut random = ScriptedRandom::new(vec![], vec![0]);
        connect(&mut fixture, 1, peer(1)).await;
        advertise(&mut fixture, 1, &["S"]).await;
        fixture.coordinator.download(&segment("S"), &mut random);

        deliver(&mut fixture, 1, data_header("master+S", 2)).await;
        let notices = deliver(&mut fixture, 1, Bytes::from_static(b"ok")).await;

        assert!(notices.iter().any(|notice| matches!(
            notice,
            SwarmNotice::SegmentFailed { error: SegmentError::Validation(_), .. }
        )));
        assert!(notices.iter().any(|notice| matches!(notice, SwarmNotice::PeerClosed { .. })));
        assert_eq!(fixture.coordinator.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_fails_outstanding_request() {
        let mut fixture = fixture();
        let mut random = ScriptedRandom::new(vec![], vec![0]);
        connect(&mut fixture, 1, peer(1)).await;
        advertise(&mut fixture, 1, &["S"]).await;
        fixture.coordinator.download(&segment("S"), &mut random);

        let notices = fixture
            .coordinator
            .handle_event(SwarmEvent::PeerClosed {
                connection: ConnectionId(1),
            })
            .await;

        assert!(matches!(
            &notices[0],
            SwarmNotice::SegmentFailed {
                error: SegmentError::Transport(TransportError::PeerDisconnected { .. }),
                ..
            }
        ));
        assert!(matches!(notices[1], SwarmNotice::AvailabilityChanged));
        assert!(matches!(notices[2], SwarmNotice::PeerClosed { .. }));
        assert_eq!(fixture.coordinator.active_downloads_count(), 0);
    }

    #[tokio::test]
    async fn test_segment_absent_triggers_availability_change() {
        let mut fixture = fixture();
        let mut random = ScriptedRandom::new(vec![], vec![0]);
        connect(&mut fixture, 1, peer(1)).await;
        advertise(&mut fixture, 1, &["S"]).await;
        fixture.coordinator.download(&segment("S"), &mut random);

        let notices = deliver(
            &mut fixture,
            1,
            PeerCommand::SegmentAbsent {
                segment_id: SegmentId::new("master+S"),
            }
            .encode(),
        )
        .await;

        assert!(matches!(notices[..], [SwarmNotice::AvailabilityChanged]));
        assert!(!fixture.coordinator.is_downloading(&SegmentId::new("master+S")));
        assert!(!fixture.coordinator.overall_availability().is_loaded(&SegmentId::new("master+S")));
    }

    #[tokio::test]
    async fn test_destroy_closes_everything() {
        let mut fixture = fixture();
        connect(&mut fixture, 1, peer(1)).await;

        fixture.coordinator.destroy();
        fixture.coordinator.destroy();

        let calls = fixture.transport.calls();
        assert!(calls.contains(&SwarmCall::StopAnnounce(
            SwarmId::for_stream("master"),
            TrackerTeardown::Hard
        )));
        assert!(calls.contains(&SwarmCall::Close(ConnectionId(1))));
        assert_eq!(fixture.coordinator.peer_count(), 0);
        assert_eq!(fixture.coordinator.swarm_id(), None);
    }
}

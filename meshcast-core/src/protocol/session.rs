//! Per-peer protocol state machine.
//!
//! A session tracks at most one outgoing segment request:
//! `Idle -> Requested -> Receiving -> Idle`. Frames must be fed in arrival
//! order; payload chunks are only meaningful after a matching data header.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use super::ProtocolError;
use super::availability::{AvailabilityMap, SegmentsMapPayload};
use super::command::{Frame, PeerCommand, decode_frame};
use crate::segment::SegmentId;
use crate::swarm::PeerId;

/// Destination for outgoing frames of one peer link.
pub trait FrameSink {
    fn send_frame(&mut self, frame: Bytes);
}

impl FrameSink for Vec<Bytes> {
    fn send_frame(&mut self, frame: Bytes) {
        self.push(frame);
    }
}

/// Observable outcomes of feeding a frame into a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer's availability map was replaced (possibly cleared)
    AvailabilityUpdated,
    /// The peer asks for a segment held locally
    SegmentRequested { segment_id: SegmentId },
    /// The peer cancelled a request it made to us
    RequestCancelled { segment_id: SegmentId },
    /// The requested segment arrived completely
    SegmentLoaded { segment_id: SegmentId, data: Bytes },
    /// The peer does not hold the requested segment
    SegmentAbsent { segment_id: SegmentId },
    /// The in-flight transfer was abandoned
    TransferFailed {
        segment_id: SegmentId,
        error: ProtocolError,
    },
    /// Payload bytes arrived for the in-flight transfer
    BytesReceived { bytes: usize },
    /// A command frame failed validation
    InvalidCommand { error: ProtocolError },
}

/// Accumulates chunks of the segment currently being received.
#[derive(Debug)]
struct DownloadingSegment {
    segment_id: SegmentId,
    size: usize,
    received: usize,
    chunks: Vec<Bytes>,
}

impl DownloadingSegment {
    fn assemble(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(self.size);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }
        data.freeze()
    }
}

#[derive(Debug)]
enum SessionState {
    Idle,
    Requested {
        segment_id: SegmentId,
        deadline: Instant,
    },
    Receiving(DownloadingSegment),
}

/// Protocol state of one connected peer.
#[derive(Debug)]
pub struct PeerSession {
    peer_id: PeerId,
    remote_address: Option<String>,
    availability: AvailabilityMap,
    state: SessionState,
    response_timeout: Duration,
    max_message_size: usize,
}

impl PeerSession {
    pub fn new(
        peer_id: PeerId,
        remote_address: Option<String>,
        response_timeout: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            peer_id,
            remote_address,
            availability: AvailabilityMap::new(),
            state: SessionState::Idle,
            response_timeout,
            max_message_size: max_message_size.max(1),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    /// Last availability map received from the peer.
    pub fn availability(&self) -> &AvailabilityMap {
        &self.availability
    }

    /// Whether no request is outstanding.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, SessionState::Idle)
    }

    /// Segment currently requested from the peer, if any.
    pub fn current_request(&self) -> Option<&SegmentId> {
        match &self.state {
            SessionState::Idle => None,
            SessionState::Requested { segment_id, .. } => Some(segment_id),
            SessionState::Receiving(downloading) => Some(&downloading.segment_id),
        }
    }

    /// Chunks received so far for the transfer in progress.
    pub fn received_chunks(&self) -> Option<&[Bytes]> {
        match &self.state {
            SessionState::Receiving(downloading) => Some(&downloading.chunks),
            _ => None,
        }
    }

    /// Response deadline while waiting for a data header.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            SessionState::Requested { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    /// Asks the peer for a segment and arms the response timer.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::RequestInFlight` - If a request is already outstanding
    pub fn request_segment(
        &mut self,
        segment_id: SegmentId,
        now: Instant,
        sink: &mut impl FrameSink,
    ) -> Result<(), ProtocolError> {
        if let Some(in_flight) = self.current_request() {
            return Err(ProtocolError::RequestInFlight {
                segment_id: in_flight.clone(),
            });
        }

        sink.send_frame(
            PeerCommand::SegmentRequest {
                segment_id: segment_id.clone(),
            }
            .encode(),
        );
        self.state = SessionState::Requested {
            segment_id,
            deadline: now + self.response_timeout,
        };
        Ok(())
    }

    /// Abandons the outstanding request and notifies the peer.
    ///
    /// Returns the chunks received so far, in order, when a transfer was in
    /// progress.
    pub fn cancel_segment_request(&mut self, sink: &mut impl FrameSink) -> Option<Vec<Bytes>> {
        let (segment_id, chunks) = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Idle => return None,
            SessionState::Requested { segment_id, .. } => (segment_id, None),
            SessionState::Receiving(downloading) => {
                (downloading.segment_id, Some(downloading.chunks))
            }
        };

        sink.send_frame(PeerCommand::CancelSegmentRequest { segment_id }.encode());
        chunks
    }

    /// Expires the outstanding request once its deadline has passed.
    ///
    /// Returns the id of the request that timed out.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<SegmentId> {
        let expired = matches!(
            &self.state,
            SessionState::Requested { deadline, .. } if now >= *deadline
        );
        if !expired {
            return None;
        }

        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Requested { segment_id, .. } => Some(segment_id),
            _ => None,
        }
    }

    /// Drops any outstanding request without notifying the peer.
    pub fn terminate(&mut self) -> Option<SegmentId> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Idle => None,
            SessionState::Requested { segment_id, .. } => Some(segment_id),
            SessionState::Receiving(downloading) => Some(downloading.segment_id),
        }
    }

    /// Feeds one frame received from the peer.
    pub fn receive_frame(&mut self, frame: Bytes) -> Vec<SessionEvent> {
        match decode_frame(frame) {
            Frame::Payload(chunk) => self.receive_payload(chunk),
            frame => {
                if let SessionState::Receiving(_) = self.state {
                    // Channel is ordered; a command mid-transfer means the
                    // peer abandoned the payload
                    return self.interrupt();
                }
                match frame {
                    Frame::Command(command) => self.receive_command(command),
                    Frame::Malformed(error) => self.receive_malformed(error),
                    Frame::Payload(_) => Vec::new(),
                }
            }
        }
    }

    /// Advertises local availability.
    pub fn send_segments_map(&self, map: &SegmentsMapPayload, sink: &mut impl FrameSink) {
        sink.send_frame(PeerCommand::SegmentsMap { map: map.clone() }.encode());
    }

    /// Sends a data header followed by the payload in bounded chunks.
    pub fn send_segment_data(&self, segment_id: SegmentId, data: &Bytes, sink: &mut impl FrameSink) {
        sink.send_frame(
            PeerCommand::SegmentData {
                segment_id,
                size: data.len(),
            }
            .encode(),
        );

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.max_message_size).min(data.len());
            sink.send_frame(data.slice(offset..end));
            offset = end;
        }
    }

    /// Tells the peer a requested segment is not held.
    pub fn send_segment_absent(&self, segment_id: SegmentId, sink: &mut impl FrameSink) {
        sink.send_frame(PeerCommand::SegmentAbsent { segment_id }.encode());
    }

    fn receive_command(&mut self, command: PeerCommand) -> Vec<SessionEvent> {
        tracing::trace!(peer_id = %self.peer_id, ?command, "Received peer command");

        match command {
            PeerCommand::SegmentsMap { map } => match map.to_availability() {
                Ok(availability) => {
                    self.availability = availability;
                    vec![SessionEvent::AvailabilityUpdated]
                }
                Err(error) => self.receive_malformed(error),
            },
            PeerCommand::SegmentRequest { segment_id } => {
                vec![SessionEvent::SegmentRequested { segment_id }]
            }
            PeerCommand::CancelSegmentRequest { segment_id } => {
                vec![SessionEvent::RequestCancelled { segment_id }]
            }
            PeerCommand::SegmentData { segment_id, size } => {
                if !self.is_requested(&segment_id) {
                    tracing::debug!(peer_id = %self.peer_id, %segment_id, "Ignoring unrequested segment data");
                    return Vec::new();
                }

                if size == 0 {
                    self.state = SessionState::Idle;
                    return vec![SessionEvent::SegmentLoaded {
                        segment_id,
                        data: Bytes::new(),
                    }];
                }

                self.state = SessionState::Receiving(DownloadingSegment {
                    segment_id,
                    size,
                    received: 0,
                    chunks: Vec::new(),
                });
                Vec::new()
            }
            PeerCommand::SegmentAbsent { segment_id } => {
                if !self.is_requested(&segment_id) {
                    return Vec::new();
                }

                self.state = SessionState::Idle;
                self.availability.remove(&segment_id);
                vec![SessionEvent::SegmentAbsent { segment_id }]
            }
        }
    }

    fn receive_malformed(&mut self, error: ProtocolError) -> Vec<SessionEvent> {
        tracing::warn!(peer_id = %self.peer_id, %error, "Invalid command from peer");

        let mut events = Vec::new();
        if matches!(error, ProtocolError::MalformedSegmentsMap { .. }) {
            self.availability = AvailabilityMap::new();
            events.push(SessionEvent::AvailabilityUpdated);
        }
        events.push(SessionEvent::InvalidCommand { error });
        events
    }

    fn receive_payload(&mut self, chunk: Bytes) -> Vec<SessionEvent> {
        let SessionState::Receiving(downloading) = &mut self.state else {
            tracing::trace!(peer_id = %self.peer_id, bytes = chunk.len(), "Ignoring unrequested payload");
            return Vec::new();
        };

        let bytes = chunk.len();
        downloading.received += bytes;
        downloading.chunks.push(chunk);

        let mut events = vec![SessionEvent::BytesReceived { bytes }];

        if downloading.received > downloading.size {
            let error = ProtocolError::TooManyBytes {
                segment_id: downloading.segment_id.clone(),
                expected: downloading.size,
                received: downloading.received,
            };
            let segment_id = downloading.segment_id.clone();
            self.state = SessionState::Idle;
            events.push(SessionEvent::TransferFailed { segment_id, error });
        } else if downloading.received == downloading.size {
            let data = downloading.assemble();
            let segment_id = downloading.segment_id.clone();
            self.state = SessionState::Idle;
            events.push(SessionEvent::SegmentLoaded { segment_id, data });
        }

        events
    }

    fn interrupt(&mut self) -> Vec<SessionEvent> {
        match self.terminate() {
            Some(segment_id) => {
                tracing::debug!(peer_id = %self.peer_id, %segment_id, "Segment download interrupted by a command");
                vec![SessionEvent::TransferFailed {
                    error: ProtocolError::InterruptedByCommand {
                        segment_id: segment_id.clone(),
                    },
                    segment_id,
                }]
            }
            None => Vec::new(),
        }
    }

    fn is_requested(&self, segment_id: &SegmentId) -> bool {
        matches!(&self.state, SessionState::Requested { segment_id: requested, .. } if requested == segment_id)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const MAX_MESSAGE: usize = 512;

    fn session() -> PeerSession {
        PeerSession::new(
            PeerId::new([1u8; 20]),
            Some("10.0.0.1:5000".to_string()),
            Duration::from_secs(60),
            MAX_MESSAGE,
        )
    }

    fn header(segment_id: &str, size: usize) -> Bytes {
        PeerCommand::SegmentData {
            segment_id: SegmentId::new(segment_id),
            size,
        }
        .encode()
    }

    #[test]
    fn test_request_while_outstanding_fails() {
        let mut session = session();
        let mut sink = Vec::new();
        let now = Instant::now();

        session
            .request_segment(SegmentId::new("m+1"), now, &mut sink)
            .unwrap();
        let error = session
            .request_segment(SegmentId::new("m+2"), now, &mut sink)
            .unwrap_err();

        assert_eq!(
            error,
            ProtocolError::RequestInFlight {
                segment_id: SegmentId::new("m+1")
            }
        );
        assert_eq!(sink.len(), 1);
        assert_eq!(session.deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_segment_loaded_from_two_chunks() {
        let mut session = session();
        let mut sink = Vec::new();
        let now = Instant::now();
        session
            .request_segment(SegmentId::new("S"), now, &mut sink)
            .unwrap();

        assert!(session.receive_frame(header("S", 1024)).is_empty());
        assert_eq!(session.deadline(), None);

        let first = session.receive_frame(Bytes::from(vec![1u8; 512]));
        assert_eq!(first, vec![SessionEvent::BytesReceived { bytes: 512 }]);

        let second = session.receive_frame(Bytes::from(vec![2u8; 512]));
        let Some(SessionEvent::SegmentLoaded { segment_id, data }) = second.last() else {
            panic!("expected segment-loaded, got {second:?}");
        };
        assert_eq!(segment_id, &SegmentId::new("S"));
        assert_eq!(data.len(), 1024);
        assert_eq!(&data[..512], &[1u8; 512][..]);
        assert!(session.is_idle());

        // Late chunk after completion is ignored
        assert!(session.receive_frame(Bytes::from_static(&[0u8])).is_empty());
    }

    #[test]
    fn test_overrun_is_protocol_error() {
        let mut session = session();
        let mut sink = Vec::new();
        session
            .request_segment(SegmentId::new("S"), Instant::now(), &mut sink)
            .unwrap();
        session.receive_frame(header("S", 1024));
        session.receive_frame(Bytes::from(vec![0u8; 512]));

        let events = session.receive_frame(Bytes::from(vec![0u8; 513]));

        assert!(events.contains(&SessionEvent::TransferFailed {
            segment_id: SegmentId::new("S"),
            error: ProtocolError::TooManyBytes {
                segment_id: SegmentId::new("S"),
                expected: 1024,
                received: 1025,
            },
        }));
        assert!(session.is_idle());
    }

    #[test]
    fn test_command_interrupts_transfer() {
        let mut session = session();
        let mut sink = Vec::new();
        session
            .request_segment(SegmentId::new("S"), Instant::now(), &mut sink)
            .unwrap();
        session.receive_frame(header("S", 100));
        session.receive_frame(Bytes::from(vec![0u8; 10]));

        let interrupting = PeerCommand::SegmentRequest {
            segment_id: SegmentId::new("m+9"),
        }
        .encode();
        let events = session.receive_frame(interrupting);

        assert_eq!(
            events,
            vec![SessionEvent::TransferFailed {
                segment_id: SegmentId::new("S"),
                error: ProtocolError::InterruptedByCommand {
                    segment_id: SegmentId::new("S")
                },
            }]
        );
        assert!(session.is_idle());
    }

    #[test]
    fn test_mismatched_headers_are_ignored() {
        let mut session = session();
        let mut sink = Vec::new();

        // Unsolicited header
        assert!(session.receive_frame(header("S", 10)).is_empty());
        assert!(session.is_idle());

        session
            .request_segment(SegmentId::new("S"), Instant::now(), &mut sink)
            .unwrap();
        assert!(session.receive_frame(header("other", 10)).is_empty());
        let absent_other = PeerCommand::SegmentAbsent {
            segment_id: SegmentId::new("other"),
        }
        .encode();
        assert!(session.receive_frame(absent_other).is_empty());
        assert_eq!(session.current_request(), Some(&SegmentId::new("S")));
    }

    #[test]
    fn test_segment_absent_clears_request_and_availability() {
        let mut session = session();
        let mut sink = Vec::new();

        let mut map = SegmentsMapPayload::new();
        map.push("m", "1", crate::segment::SegmentStatus::Loaded);
        let events = session.receive_frame(PeerCommand::SegmentsMap { map }.encode());
        assert_eq!(events, vec![SessionEvent::AvailabilityUpdated]);
        assert!(session.availability().is_loaded(&SegmentId::new("m+1")));

        session
            .request_segment(SegmentId::new("m+1"), Instant::now(), &mut sink)
            .unwrap();
        let events = session.receive_frame(
            PeerCommand::SegmentAbsent {
                segment_id: SegmentId::new("m+1"),
            }
            .encode(),
        );

        assert_eq!(
            events,
            vec![SessionEvent::SegmentAbsent {
                segment_id: SegmentId::new("m+1")
            }]
        );
        assert!(session.is_idle());
        assert!(session.availability().is_empty());
    }

    #[test]
    fn test_malformed_map_clears_availability() {
        let mut session = session();
        let mut map = SegmentsMapPayload::new();
        map.push("m", "1", crate::segment::SegmentStatus::Loaded);
        session.receive_frame(PeerCommand::SegmentsMap { map }.encode());

        let events = session.receive_frame(Bytes::from_static(br#"{"c":2,"m":{"m":["1|2",[0]]}}"#));

        assert_eq!(events[0], SessionEvent::AvailabilityUpdated);
        assert!(matches!(
            events[1],
            SessionEvent::InvalidCommand {
                error: ProtocolError::MalformedSegmentsMap { .. }
            }
        ));
        assert!(session.availability().is_empty());
    }

    #[test]
    fn test_timeout_expires_request() {
        let mut session = session();
        let mut sink = Vec::new();
        let now = Instant::now();
        session
            .request_segment(SegmentId::new("S"), now, &mut sink)
            .unwrap();

        assert_eq!(session.poll_timeout(now + Duration::from_secs(59)), None);
        assert_eq!(
            session.poll_timeout(now + Duration::from_secs(60)),
            Some(SegmentId::new("S"))
        );
        assert!(session.is_idle());
    }

    #[test]
    fn test_cancel_returns_partial_chunks() {
        let mut session = session();
        let mut sink = Vec::new();
        session
            .request_segment(SegmentId::new("S"), Instant::now(), &mut sink)
            .unwrap();
        session.receive_frame(header("S", 100));
        session.receive_frame(Bytes::from_static(b"abc"));
        session.receive_frame(Bytes::from_static(b"de"));
        assert_eq!(session.received_chunks().map(|chunks| chunks.len()), Some(2));
        // Peeking leaves the request running
        assert_eq!(sink.len(), 1);

        let chunks = session.cancel_segment_request(&mut sink).unwrap();

        assert_eq!(chunks, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")]);
        let cancel: serde_json::Value = serde_json::from_slice(sink.last().unwrap()).unwrap();
        assert_eq!(cancel, serde_json::json!({ "c": 4, "i": "S" }));
        assert!(session.cancel_segment_request(&mut sink).is_none());
    }

    #[test]
    fn test_send_segment_data_chunks_payload() {
        let session = session();
        let mut sink = Vec::new();
        let data = Bytes::from(vec![7u8; 1100]);

        session.send_segment_data(SegmentId::new("S"), &data, &mut sink);

        assert_eq!(sink.len(), 4);
        assert_eq!(sink[0], header("S", 1100));
        assert_eq!(
            sink[1..].iter().map(Bytes::len).collect::<Vec<_>>(),
            vec![512, 512, 76]
        );
    }

    #[test]
    fn test_zero_size_segment_completes_immediately() {
        let mut session = session();
        let mut sink = Vec::new();
        session
            .request_segment(SegmentId::new("S"), Instant::now(), &mut sink)
            .unwrap();

        let events = session.receive_frame(header("S", 0));

        assert_eq!(
            events,
            vec![SessionEvent::SegmentLoaded {
                segment_id: SegmentId::new("S"),
                data: Bytes::new(),
            }]
        );
    }

    proptest! {
        #[test]
        fn test_reassembly_reconstructs_buffer(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            max_message_size in 1usize..1024,
        ) {
            // Chunks starting with `{"` could be mistaken for commands
            prop_assume!(!data.starts_with(b"{\""));

            let sender = PeerSession::new(
                PeerId::new([2u8; 20]),
                None,
                Duration::from_secs(60),
                max_message_size,
            );
            let mut receiver = session();
            let mut requests = Vec::new();
            receiver
                .request_segment(SegmentId::new("S"), Instant::now(), &mut requests)
                .unwrap();

            let data = Bytes::from(data);
            let mut frames = Vec::new();
            sender.send_segment_data(SegmentId::new("S"), &data, &mut frames);
            prop_assert!(frames[1..].iter().all(|chunk| chunk.len() <= max_message_size));

            let mut loaded = None;
            for frame in frames {
                for event in receiver.receive_frame(frame) {
                    if let SessionEvent::SegmentLoaded { data, .. } = event {
                        loaded = Some(data);
                    }
                }
            }

            prop_assert_eq!(loaded, Some(data));
        }

        #[test]
        fn test_one_extra_byte_overruns(size in 1usize..2048) {
            let mut receiver = session();
            let mut requests = Vec::new();
            receiver
                .request_segment(SegmentId::new("S"), Instant::now(), &mut requests)
                .unwrap();
            receiver.receive_frame(header("S", size));

            let events = receiver.receive_frame(Bytes::from(vec![0u8; size + 1]));

            let overran = events.iter().any(|event| matches!(
                event,
                SessionEvent::TransferFailed { error: ProtocolError::TooManyBytes { .. }, .. }
            ));
            prop_assert!(overran);
        }
    }
}

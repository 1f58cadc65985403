//! Failure taxonomy for segment transports.
//!
//! Every failure that can happen to a single segment download is expressed as
//! a `SegmentError`. These are informational: the engine recovers from all of
//! them (HTTP cooldown, peer drop) and reports them to subscribers.

use std::time::Duration;

use crate::protocol::ProtocolError;
use crate::swarm::PeerId;
use crate::validation::ValidationError;

/// Network-level failures of either transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Network failure: {reason}")]
    Network { reason: String },

    #[error("Peer {peer_id} disconnected")]
    PeerDisconnected { peer_id: PeerId },

    #[error("Channel closed: {reason}")]
    ChannelClosed { reason: String },
}

/// Coarse classification of segment failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Validation,
}

/// A failed attempt to obtain one segment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Peer {peer_id} did not respond within {timeout:?}")]
    Timeout { peer_id: PeerId, timeout: Duration },

    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Validation(#[from] ValidationError),
}

impl SegmentError {
    /// Returns the taxonomy bucket of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SegmentError::Transport(_) => ErrorKind::Transport,
            SegmentError::Timeout { .. } => ErrorKind::Timeout,
            SegmentError::Protocol(_) => ErrorKind::Protocol,
            SegmentError::Validation(_) => ErrorKind::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentId;

    #[test]
    fn test_segment_error_kind_mapping() {
        let peer_id = PeerId::new([7u8; 20]);

        let transport = SegmentError::from(TransportError::PeerDisconnected { peer_id });
        assert_eq!(transport.kind(), ErrorKind::Transport);

        let timeout = SegmentError::Timeout {
            peer_id,
            timeout: Duration::from_secs(60),
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let protocol = SegmentError::from(ProtocolError::TooManyBytes {
            segment_id: SegmentId::new("m+1"),
            expected: 4,
            received: 5,
        });
        assert_eq!(protocol.kind(), ErrorKind::Protocol);

        let validation = SegmentError::from(ValidationError::new(
            SegmentId::new("m+1"),
            "checksum mismatch",
        ));
        assert_eq!(validation.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_http_status_display() {
        let error = TransportError::HttpStatus {
            status: 404,
            url: "http://origin/seg1.ts".to_string(),
        };
        assert_eq!(error.to_string(), "HTTP status 404 for http://origin/seg1.ts");
    }
}

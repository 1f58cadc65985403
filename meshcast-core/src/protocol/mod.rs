//! Peer wire protocol.
//!
//! Peers exchange compact JSON control commands and raw segment payload
//! chunks over one ordered data channel. This module holds the command codec,
//! the availability map encoding, and the per-peer session state machine.

pub mod availability;
pub mod command;
pub mod session;

pub use availability::{AvailabilityMap, SegmentsMapPayload};
pub use command::{Frame, PeerCommand, decode_frame};
pub use session::{FrameSink, PeerSession, SessionEvent};

use crate::segment::SegmentId;

/// Peer protocol version, mixed into every swarm identifier.
pub const PROTOCOL_VERSION: &str = "2";

/// Peer wire protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error(
        "Too many bytes received for segment {segment_id}: expected {expected}, received {received}"
    )]
    TooManyBytes {
        segment_id: SegmentId,
        expected: usize,
        received: usize,
    },

    #[error("Download of segment {segment_id} interrupted by a command")]
    InterruptedByCommand { segment_id: SegmentId },

    #[error("Malformed segments map: {reason}")]
    MalformedSegmentsMap { reason: String },

    #[error("Malformed command: {reason}")]
    MalformedCommand { reason: String },

    #[error("Segment {segment_id} is already being requested from this peer")]
    RequestInFlight { segment_id: SegmentId },
}

//! Observable loader events.

use crate::error::SegmentError;
use crate::segment::{DownloadMethod, Segment};
use crate::swarm::PeerId;

/// Events published to loader subscribers.
///
/// Delivered over a broadcast channel; slow subscribers may observe
/// `RecvError::Lagged` and miss events.
#[derive(Debug, Clone)]
pub enum LoaderNotification {
    /// A segment was downloaded and stored; `peer_id` is set for P2P
    SegmentLoaded {
        segment: Segment,
        peer_id: Option<PeerId>,
    },
    SegmentError {
        segment: Segment,
        error: SegmentError,
        peer_id: Option<PeerId>,
    },
    /// A download was cancelled because the segment left the queue
    SegmentAbort { segment: Segment },
    PeerConnect {
        peer_id: PeerId,
        remote_address: Option<String>,
    },
    PeerClose { peer_id: PeerId },
    /// Bytes served to a peer
    BytesUploaded {
        method: DownloadMethod,
        bytes: usize,
        peer_id: PeerId,
    },
}

impl LoaderNotification {
    /// Stable event name for logs and the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            LoaderNotification::SegmentLoaded { .. } => "segment-loaded",
            LoaderNotification::SegmentError { .. } => "segment-error",
            LoaderNotification::SegmentAbort { .. } => "segment-abort",
            LoaderNotification::PeerConnect { .. } => "peer-connect",
            LoaderNotification::PeerClose { .. } => "peer-close",
            LoaderNotification::BytesUploaded { .. } => "bytes-uploaded",
        }
    }
}

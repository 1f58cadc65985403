//! Command definitions for the loader actor.

use tokio::sync::oneshot;

use crate::config::LoaderConfig;
use crate::segment::{Segment, SegmentId};
use crate::swarm::PeerId;

/// Snapshot of scheduler activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub queued_segments: usize,
    pub http_downloads: usize,
    pub p2p_downloads: usize,
    pub connected_peers: usize,
}

/// Commands that can be sent to the loader actor.
///
/// Each command carries a response channel; the actor applies commands one
/// at a time, so no command observes another half-applied.
pub enum LoaderCommand {
    /// Replace the segment queue.
    Load {
        queue: Vec<Segment>,
        stream_swarm_id: String,
        responder: oneshot::Sender<crate::Result<()>>,
    },
    /// Look up a cached segment.
    GetSegment {
        segment_id: SegmentId,
        responder: oneshot::Sender<crate::Result<Option<Segment>>>,
    },
    /// Get the effective configuration.
    GetSettings {
        responder: oneshot::Sender<LoaderConfig>,
    },
    /// Get the local peer id.
    GetPeerId { responder: oneshot::Sender<PeerId> },
    /// Get activity counters.
    GetStats {
        responder: oneshot::Sender<LoaderStats>,
    },
    /// Tear everything down and stop the actor.
    Destroy {
        responder: oneshot::Sender<crate::Result<()>>,
    },
}

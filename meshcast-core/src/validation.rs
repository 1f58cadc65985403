//! Integrator hooks: payload validation and request URL rewriting.

use bytes::Bytes;

use crate::segment::{DownloadMethod, Segment, SegmentId};
use crate::swarm::PeerId;

/// Rejection of downloaded segment bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Segment {segment_id} failed validation: {reason}")]
pub struct ValidationError {
    pub segment_id: SegmentId,
    pub reason: String,
}

impl ValidationError {
    pub fn new(segment_id: SegmentId, reason: impl Into<String>) -> Self {
        Self {
            segment_id,
            reason: reason.into(),
        }
    }
}

/// Checks downloaded bytes before they are accepted.
///
/// Called once per completed download. A rejection of HTTP bytes puts the
/// segment on cooldown; a rejection of peer bytes drops the peer.
pub trait SegmentValidator: Send + Sync {
    /// # Errors
    ///
    /// - `ValidationError` - If the payload must not be stored or served
    fn validate(
        &self,
        segment: &Segment,
        data: &Bytes,
        method: DownloadMethod,
        peer_id: Option<&PeerId>,
    ) -> Result<(), ValidationError>;
}

impl<F> SegmentValidator for F
where
    F: Fn(&Segment, &Bytes, DownloadMethod, Option<&PeerId>) -> Result<(), ValidationError>
        + Send
        + Sync,
{
    fn validate(
        &self,
        segment: &Segment,
        data: &Bytes,
        method: DownloadMethod,
        peer_id: Option<&PeerId>,
    ) -> Result<(), ValidationError> {
        self(segment, data, method, peer_id)
    }
}

/// Rewrites the URL a segment is requested from.
pub trait SegmentUrlBuilder: Send + Sync {
    fn build_url(&self, segment: &Segment) -> String;
}

impl<F> SegmentUrlBuilder for F
where
    F: Fn(&Segment) -> String + Send + Sync,
{
    fn build_url(&self, segment: &Segment) -> String {
        self(segment)
    }
}

//! Segment identity and lifecycle data.

use std::borrow::Borrow;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Stable, stream-qualified identifier of a segment.
///
/// Formed as `<stream swarm id>+<sequence>` so that availability maps from
/// peers can be keyed the same way as the local queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    /// Wraps a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the identifier of `sequence` within a stream swarm.
    pub fn in_swarm(stream_swarm_id: &str, sequence: &str) -> Self {
        Self(format!("{stream_swarm_id}+{sequence}"))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SegmentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SegmentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SegmentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Returns the swarm grouping key of one stream within a master swarm.
pub fn stream_swarm_id(master_swarm_id: &str, stream_id: Option<&str>) -> String {
    match stream_id {
        Some(stream_id) => format!("{master_swarm_id}+{stream_id}"),
        None => master_swarm_id.to_string(),
    }
}

/// Availability of a segment as advertised to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentStatus {
    /// Segment bytes are held and can be served
    Loaded,
    /// Segment is being fetched from the origin right now
    LoadingByHttp,
}

impl SegmentStatus {
    /// Numeric code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            SegmentStatus::Loaded => 0,
            SegmentStatus::LoadingByHttp => 1,
        }
    }

    /// Parses a wire status code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(SegmentStatus::Loaded),
            1 => Some(SegmentStatus::LoadingByHttp),
            _ => None,
        }
    }
}

/// Which transport delivered (or failed to deliver) a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadMethod {
    Http,
    P2p,
}

impl fmt::Display for DownloadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadMethod::Http => write!(f, "http"),
            DownloadMethod::P2p => write!(f, "p2p"),
        }
    }
}

/// One addressable chunk of media.
///
/// Identity fields are fixed at creation; `request_url`, `response_url`,
/// `data` and `download_bandwidth` are filled in while the segment moves
/// through a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: SegmentId,
    pub url: String,
    /// Explicit HTTP byte range (`Range` header value), if the media uses one
    pub range: Option<String>,
    /// Lower is more urgent
    pub priority: i32,
    pub sequence: String,
    pub stream_id: Option<String>,
    pub master_swarm_id: String,
    pub request_url: Option<String>,
    pub response_url: Option<String>,
    pub data: Option<Bytes>,
    /// Observed throughput in bytes per second when the segment completed
    pub download_bandwidth: Option<f64>,
}

impl Segment {
    /// Creates a segment with priority 0 and no byte range.
    pub fn new(
        master_swarm_id: impl Into<String>,
        stream_id: Option<&str>,
        sequence: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let master_swarm_id = master_swarm_id.into();
        let sequence = sequence.into();
        let swarm = stream_swarm_id(&master_swarm_id, stream_id);

        Self {
            id: SegmentId::in_swarm(&swarm, &sequence),
            url: url.into(),
            range: None,
            priority: 0,
            sequence,
            stream_id: stream_id.map(str::to_string),
            master_swarm_id,
            request_url: None,
            response_url: None,
            data: None,
            download_bandwidth: None,
        }
    }

    /// Sets the scheduling priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets an explicit HTTP byte range.
    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    /// Returns the swarm grouping key this segment is advertised under.
    pub fn stream_swarm_id(&self) -> String {
        stream_swarm_id(&self.master_swarm_id, self.stream_id.as_deref())
    }

    /// Number of payload bytes held, zero before download.
    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_id_is_stream_qualified() {
        let with_stream = Segment::new("master", Some("720p"), "12", "http://origin/12.ts");
        assert_eq!(with_stream.id.as_str(), "master+720p+12");
        assert_eq!(with_stream.stream_swarm_id(), "master+720p");

        let without_stream = Segment::new("master", None, "12", "http://origin/12.ts");
        assert_eq!(without_stream.id.as_str(), "master+12");
        assert_eq!(without_stream.stream_swarm_id(), "master");
    }

    #[test]
    fn test_segment_status_codes() {
        assert_eq!(SegmentStatus::Loaded.code(), 0);
        assert_eq!(SegmentStatus::LoadingByHttp.code(), 1);
        assert_eq!(SegmentStatus::from_code(0), Some(SegmentStatus::Loaded));
        assert_eq!(SegmentStatus::from_code(1), Some(SegmentStatus::LoadingByHttp));
        assert_eq!(SegmentStatus::from_code(2), None);
    }

    #[test]
    fn test_segment_builders() {
        let segment = Segment::new("m", None, "3", "http://origin/3.ts")
            .with_priority(-1)
            .with_range("bytes=0-99");

        assert_eq!(segment.priority, -1);
        assert_eq!(segment.range.as_deref(), Some("bytes=0-99"));
        assert_eq!(segment.data_len(), 0);
    }
}

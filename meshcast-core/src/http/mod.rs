//! Origin (HTTP) downloads.
//!
//! `HttpDownloader` owns the bookkeeping: active fetches, range resumption,
//! validation and failure cooldowns. Requests themselves go through the
//! `HttpTransport` seam, which reports back with `HttpEvent`s.

pub mod cooldown;
pub mod downloader;
pub mod reqwest_transport;

use std::fmt;

use bytes::Bytes;

pub use cooldown::FailedSegmentRegistry;
pub use downloader::{HttpDownloader, HttpNotice};
pub use reqwest_transport::ReqwestTransport;

use crate::error::TransportError;
use crate::segment::SegmentId;

/// Identifies one HTTP request.
///
/// Ids are never reused, so events of aborted requests can be told apart
/// from a restarted download of the same segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchId(pub u64);

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch-{}", self.0)
    }
}

/// A request handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFetch {
    pub fetch_id: FetchId,
    pub segment_id: SegmentId,
    pub url: String,
    /// Value of the `Range` header, if any
    pub range: Option<String>,
}

/// Progress and completion reports from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpEvent {
    /// Body bytes arrived
    Progress { fetch_id: FetchId, bytes: usize },
    /// The response finished; any status code
    Completed {
        fetch_id: FetchId,
        status: u16,
        data: Bytes,
        /// Final URL after redirects
        response_url: Option<String>,
    },
    /// The request failed before a response was complete
    Failed {
        fetch_id: FetchId,
        error: TransportError,
    },
}

impl HttpEvent {
    pub fn fetch_id(&self) -> FetchId {
        match self {
            HttpEvent::Progress { fetch_id, .. }
            | HttpEvent::Completed { fetch_id, .. }
            | HttpEvent::Failed { fetch_id, .. } => *fetch_id,
        }
    }
}

/// Issues HTTP requests.
///
/// Calls never block; outcomes arrive as `HttpEvent`s on the channel the
/// transport was created with.
pub trait HttpTransport: Send + Sync {
    /// Starts a request.
    ///
    /// # Errors
    ///
    /// - `TransportError::Network` - If the request could not be issued
    fn start(&self, fetch: HttpFetch) -> Result<(), TransportError>;

    /// Cancels a request. No event is reported for it afterwards.
    fn abort(&self, fetch_id: FetchId);
}

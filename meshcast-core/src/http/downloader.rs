//! HTTP download bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use super::{FailedSegmentRegistry, FetchId, HttpEvent, HttpFetch, HttpTransport};
use crate::clock::SharedClock;
use crate::config::HttpConfig;
use crate::error::{SegmentError, TransportError};
use crate::segment::{DownloadMethod, Segment, SegmentId};
use crate::validation::{SegmentUrlBuilder, SegmentValidator};

/// Outcomes of HTTP events the scheduler reacts to.
#[derive(Debug, Clone)]
pub enum HttpNotice {
    BytesDownloaded { bytes: usize },
    SegmentLoaded { segment: Segment, data: Bytes },
    SegmentFailed { segment: Segment, error: SegmentError },
}

#[derive(Debug)]
struct ActiveFetch {
    fetch_id: FetchId,
    segment: Segment,
    /// Bytes already received from a peer, prepended to a 206 body
    resume: Option<Vec<Bytes>>,
}

/// Tracks in-flight origin downloads.
pub struct HttpDownloader {
    transport: Arc<dyn HttpTransport>,
    url_builder: Option<Arc<dyn SegmentUrlBuilder>>,
    validator: Option<Arc<dyn SegmentValidator>>,
    config: HttpConfig,
    clock: SharedClock,
    next_fetch_id: u64,
    active: HashMap<SegmentId, ActiveFetch>,
    fetches: HashMap<FetchId, SegmentId>,
    failed: FailedSegmentRegistry,
}

impl HttpDownloader {
    pub fn new(
        config: HttpConfig,
        transport: Arc<dyn HttpTransport>,
        url_builder: Option<Arc<dyn SegmentUrlBuilder>>,
        validator: Option<Arc<dyn SegmentValidator>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            transport,
            url_builder,
            validator,
            config,
            clock,
            next_fetch_id: 0,
            active: HashMap::new(),
            fetches: HashMap::new(),
            failed: FailedSegmentRegistry::new(),
        }
    }

    /// Starts downloading a segment from its origin.
    ///
    /// `resume` holds bytes a peer already delivered; they are reused through
    /// a range request when ranges are enabled and the segment has no
    /// explicit range.
    ///
    /// Returns false if the request could not be issued. The segment is then
    /// put on cooldown.
    pub fn download(&mut self, segment: &Segment, resume: Option<Vec<Bytes>>) -> bool {
        let now = self.clock.now();
        self.failed.purge_expired(now);

        if self.active.contains_key(&segment.id) {
            return false;
        }

        let url = match &self.url_builder {
            Some(builder) => builder.build_url(segment),
            None => segment.url.clone(),
        };

        let resume = resume.filter(|chunks| !chunks.is_empty());
        let (range, resume) = match (&segment.range, resume) {
            (Some(range), _) => (Some(range.clone()), None),
            (None, Some(chunks)) if self.config.use_ranges => {
                let offset: usize = chunks.iter().map(Bytes::len).sum();
                (Some(format!("bytes={offset}-")), Some(chunks))
            }
            _ => (None, None),
        };

        self.next_fetch_id += 1;
        let fetch_id = FetchId(self.next_fetch_id);

        let mut segment = segment.clone();
        segment.request_url = Some(url.clone());

        let fetch = HttpFetch {
            fetch_id,
            segment_id: segment.id.clone(),
            url,
            range,
        };
        tracing::debug!(%fetch_id, segment_id = %segment.id, url = %fetch.url, range = ?fetch.range, "Starting HTTP download");

        if let Err(e) = self.transport.start(fetch) {
            tracing::warn!(segment_id = %segment.id, error = %e, "Failed to issue HTTP request");
            self.failed
                .mark_failed(segment.id.clone(), now + self.config.failed_segment_timeout);
            return false;
        }

        self.fetches.insert(fetch_id, segment.id.clone());
        self.active.insert(
            segment.id.clone(),
            ActiveFetch {
                fetch_id,
                segment,
                resume,
            },
        );
        true
    }

    /// Forgets failed segments whose cooldown has elapsed at `now`.
    pub fn purge_failed(&mut self, now: Instant) {
        self.failed.purge_expired(now);
    }

    /// Segments currently on cooldown, expired entries included until purged.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Cancels the download of a segment, if any.
    pub fn abort(&mut self, segment_id: &SegmentId) -> bool {
        let Some(fetch) = self.active.remove(segment_id) else {
            return false;
        };

        tracing::debug!(fetch_id = %fetch.fetch_id, %segment_id, "Aborting HTTP download");
        self.fetches.remove(&fetch.fetch_id);
        self.transport.abort(fetch.fetch_id);
        true
    }

    pub fn is_downloading(&self, segment_id: &SegmentId) -> bool {
        self.active.contains_key(segment_id)
    }

    /// Whether the segment is cooling down after a failure.
    pub fn is_failed(&self, segment_id: &SegmentId) -> bool {
        self.failed.is_failed(segment_id, self.clock.now())
    }

    pub fn active_downloads_count(&self) -> usize {
        self.active.len()
    }

    /// Segments currently downloading, in no particular order.
    pub fn active_segments(&self) -> impl Iterator<Item = &Segment> {
        self.active.values().map(|fetch| &fetch.segment)
    }

    /// Applies one transport event. Events of aborted requests are ignored.
    pub fn handle_event(&mut self, event: HttpEvent) -> Vec<HttpNotice> {
        let Some(segment_id) = self.fetches.get(&event.fetch_id()).cloned() else {
            tracing::trace!(fetch_id = %event.fetch_id(), "Ignoring event of finished request");
            return Vec::new();
        };

        match event {
            HttpEvent::Progress { bytes, .. } => vec![HttpNotice::BytesDownloaded { bytes }],
            HttpEvent::Completed {
                fetch_id,
                status,
                data,
                response_url,
            } => {
                let Some(fetch) = self.finish(fetch_id, &segment_id) else {
                    return Vec::new();
                };
                vec![self.on_completed(fetch, status, data, response_url)]
            }
            HttpEvent::Failed { fetch_id, error } => {
                let Some(fetch) = self.finish(fetch_id, &segment_id) else {
                    return Vec::new();
                };
                tracing::warn!(%segment_id, %error, "HTTP download failed");
                vec![self.fail(fetch.segment, SegmentError::Transport(error))]
            }
        }
    }

    /// Cancels every download.
    pub fn destroy(&mut self) {
        for (_, fetch) in self.active.drain() {
            self.transport.abort(fetch.fetch_id);
        }
        self.fetches.clear();
    }

    fn finish(&mut self, fetch_id: FetchId, segment_id: &SegmentId) -> Option<ActiveFetch> {
        self.fetches.remove(&fetch_id);
        self.active.remove(segment_id)
    }

    fn on_completed(
        &mut self,
        fetch: ActiveFetch,
        status: u16,
        body: Bytes,
        response_url: Option<String>,
    ) -> HttpNotice {
        let mut segment = fetch.segment;

        if !(200..300).contains(&status) {
            let url = segment.request_url.clone().unwrap_or_else(|| segment.url.clone());
            tracing::warn!(segment_id = %segment.id, status, url, "HTTP download rejected by origin");
            return self.fail(segment, SegmentError::Transport(TransportError::HttpStatus { status, url }));
        }

        let data = match fetch.resume {
            Some(chunks) if status == 206 => {
                let mut stitched =
                    BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum::<usize>() + body.len());
                for chunk in &chunks {
                    stitched.extend_from_slice(chunk);
                }
                stitched.extend_from_slice(&body);
                stitched.freeze()
            }
            _ => body,
        };

        if let Some(validator) = &self.validator {
            if let Err(error) = validator.validate(&segment, &data, DownloadMethod::Http, None) {
                tracing::warn!(segment_id = %segment.id, %error, "HTTP segment failed validation");
                return self.fail(segment, SegmentError::Validation(error));
            }
        }

        segment.response_url = response_url;
        tracing::debug!(segment_id = %segment.id, bytes = data.len(), "HTTP download complete");
        HttpNotice::SegmentLoaded { segment, data }
    }

    fn fail(&mut self, segment: Segment, error: SegmentError) -> HttpNotice {
        let until: Instant = self.clock.now() + self.config.failed_segment_timeout;
        self.failed.mark_failed(segment.id.clone(), until);
        HttpNotice::SegmentFailed { segment, error }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::swarm::PeerId;
    use crate::test_mocks::MockHttpTransport;
    use crate::validation::ValidationError;

    fn downloader_with(
        config: HttpConfig,
        validator: Option<Arc<dyn SegmentValidator>>,
    ) -> (HttpDownloader, MockHttpTransport, ManualClock) {
        let clock = ManualClock::new();
        let transport = MockHttpTransport::new();
        let downloader = HttpDownloader::new(
            config,
            Arc::new(transport.clone()),
            None,
            validator,
            clock.shared(),
        );
        (downloader, transport, clock)
    }

    fn downloader() -> (HttpDownloader, MockHttpTransport, ManualClock) {
        downloader_with(HttpConfig::default(), None)
    }

    fn segment(sequence: &str) -> Segment {
        Segment::new("master", None, sequence, format!("http://origin/{sequence}.ts"))
    }

    fn completed(fetch_id: FetchId, status: u16, body: &'static [u8]) -> HttpEvent {
        HttpEvent::Completed {
            fetch_id,
            status,
            data: Bytes::from_static(body),
            response_url: Some("http://cdn/final.ts".to_string()),
        }
    }

    #[test]
    fn test_download_and_complete() {
        let (mut downloader, transport, _clock) = downloader();

        assert!(downloader.download(&segment("1"), None));
        assert!(!downloader.download(&segment("1"), None));
        let fetch = transport.started()[0].clone();
        assert_eq!(fetch.url, "http://origin/1.ts");
        assert_eq!(fetch.range, None);

        let progress = downloader.handle_event(HttpEvent::Progress {
            fetch_id: fetch.fetch_id,
            bytes: 3,
        });
        assert!(matches!(progress[..], [HttpNotice::BytesDownloaded { bytes: 3 }]));

        let notices = downloader.handle_event(completed(fetch.fetch_id, 200, b"abc"));
        let [HttpNotice::SegmentLoaded { segment, data }] = &notices[..] else {
            panic!("expected a loaded segment, got {notices:?}");
        };
        assert_eq!(&data[..], b"abc");
        assert_eq!(segment.request_url.as_deref(), Some("http://origin/1.ts"));
        assert_eq!(segment.response_url.as_deref(), Some("http://cdn/final.ts"));
        assert_eq!(downloader.active_downloads_count(), 0);
    }

    #[test]
    fn test_http_error_status_starts_cooldown() {
        let (mut downloader, transport, clock) = downloader();
        downloader.download(&segment("1"), None);
        let fetch_id = transport.started()[0].fetch_id;

        let notices = downloader.handle_event(completed(fetch_id, 404, b""));

        assert!(matches!(
            &notices[..],
            [HttpNotice::SegmentFailed {
                error: SegmentError::Transport(TransportError::HttpStatus { status: 404, .. }),
                ..
            }]
        ));
        let id = SegmentId::new("master+1");
        assert!(downloader.is_failed(&id));
        clock.advance(Duration::from_secs(9));
        assert!(downloader.is_failed(&id));
        clock.advance(Duration::from_secs(1));
        assert!(!downloader.is_failed(&id));
    }

    #[test]
    fn test_transport_failure_starts_cooldown() {
        let (mut downloader, transport, _clock) = downloader();
        downloader.download(&segment("1"), None);
        let fetch_id = transport.started()[0].fetch_id;

        let notices = downloader.handle_event(HttpEvent::Failed {
            fetch_id,
            error: TransportError::Network {
                reason: "connection reset".to_string(),
            },
        });

        assert!(matches!(notices[..], [HttpNotice::SegmentFailed { .. }]));
        assert!(downloader.is_failed(&SegmentId::new("master+1")));
    }

    #[test]
    fn test_start_error_is_silent_cooldown() {
        let (mut downloader, transport, _clock) = downloader();
        transport.fail_starts(true);

        assert!(!downloader.download(&segment("1"), None));
        assert!(downloader.is_failed(&SegmentId::new("master+1")));
        assert!(!downloader.is_downloading(&SegmentId::new("master+1")));
    }

    #[test]
    fn test_purge_failed_drops_elapsed_cooldowns() {
        let (mut downloader, transport, clock) = downloader();
        transport.fail_starts(true);
        downloader.download(&segment("1"), None);
        assert_eq!(downloader.failed_count(), 1);

        downloader.purge_failed(clock.now() + Duration::from_secs(9));
        assert_eq!(downloader.failed_count(), 1);

        clock.advance(Duration::from_secs(10));
        downloader.purge_failed(clock.now());
        assert_eq!(downloader.failed_count(), 0);
        assert!(!downloader.is_failed(&SegmentId::new("master+1")));
    }

    #[test]
    fn test_aborted_fetch_events_are_ignored() {
        let (mut downloader, transport, _clock) = downloader();
        downloader.download(&segment("1"), None);
        let fetch_id = transport.started()[0].fetch_id;

        assert!(downloader.abort(&SegmentId::new("master+1")));
        assert!(!downloader.abort(&SegmentId::new("master+1")));
        assert_eq!(transport.aborted(), vec![fetch_id]);

        assert!(downloader.handle_event(completed(fetch_id, 200, b"late")).is_empty());
    }

    #[test]
    fn test_resume_uses_range_and_stitches_partial_content() {
        let config = HttpConfig {
            use_ranges: true,
            ..HttpConfig::default()
        };
        let (mut downloader, transport, _clock) = downloader_with(config, None);

        let partial = vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")];
        downloader.download(&segment("1"), Some(partial));
        let fetch = transport.started()[0].clone();
        assert_eq!(fetch.range.as_deref(), Some("bytes=4-"));

        let notices = downloader.handle_event(completed(fetch.fetch_id, 206, b"ef"));
        let [HttpNotice::SegmentLoaded { data, .. }] = &notices[..] else {
            panic!("expected a loaded segment");
        };
        assert_eq!(&data[..], b"abcdef");
    }

    #[test]
    fn test_full_response_ignores_resume_bytes() {
        let config = HttpConfig {
            use_ranges: true,
            ..HttpConfig::default()
        };
        let (mut downloader, transport, _clock) = downloader_with(config, None);
        downloader.download(&segment("1"), Some(vec![Bytes::from_static(b"ab")]));
        let fetch_id = transport.started()[0].fetch_id;

        let notices = downloader.handle_event(completed(fetch_id, 200, b"abcdef"));
        let [HttpNotice::SegmentLoaded { data, .. }] = &notices[..] else {
            panic!("expected a loaded segment");
        };
        assert_eq!(&data[..], b"abcdef");
    }

    #[test]
    fn test_resume_dropped_without_ranges_or_with_explicit_range() {
        let (mut downloader, transport, _clock) = downloader();
        downloader.download(&segment("1"), Some(vec![Bytes::from_static(b"ab")]));
        assert_eq!(transport.started()[0].range, None);

        let config = HttpConfig {
            use_ranges: true,
            ..HttpConfig::default()
        };
        let (mut downloader, transport, _clock) = downloader_with(config, None);
        let ranged = segment("2").with_range("bytes=100-199");
        downloader.download(&ranged, Some(vec![Bytes::from_static(b"ab")]));
        assert_eq!(transport.started()[0].range.as_deref(), Some("bytes=100-199"));
    }

    #[test]
    fn test_validator_rejection_starts_cooldown() {
        let validator: Arc<dyn SegmentValidator> = Arc::new(
            |segment: &Segment, _data: &Bytes, method: DownloadMethod, _peer: Option<&PeerId>| {
                assert_eq!(method, DownloadMethod::Http);
                Err(ValidationError::new(segment.id.clone(), "truncated"))
            },
        );
        let (mut downloader, transport, _clock) =
            downloader_with(HttpConfig::default(), Some(validator));
        downloader.download(&segment("1"), None);
        let fetch_id = transport.started()[0].fetch_id;

        let notices = downloader.handle_event(completed(fetch_id, 200, b"abc"));

        assert!(matches!(
            notices[..],
            [HttpNotice::SegmentFailed { error: SegmentError::Validation(_), .. }]
        ));
        assert!(downloader.is_failed(&SegmentId::new("master+1")));
    }

    #[test]
    fn test_url_builder_rewrites_request() {
        let clock = ManualClock::new();
        let transport = MockHttpTransport::new();
        let builder: Arc<dyn SegmentUrlBuilder> =
            Arc::new(|segment: &Segment| format!("{}?token=abc", segment.url));
        let mut downloader = HttpDownloader::new(
            HttpConfig::default(),
            Arc::new(transport.clone()),
            Some(builder),
            None,
            clock.shared(),
        );

        downloader.download(&segment("1"), None);

        assert_eq!(transport.started()[0].url, "http://origin/1.ts?token=abc");
        assert_eq!(
            downloader.active_segments().next().and_then(|s| s.request_url.clone()),
            Some("http://origin/1.ts?token=abc".to_string())
        );
    }
}

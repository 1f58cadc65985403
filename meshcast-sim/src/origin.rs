//! Simulated HTTP origin.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use meshcast_core::TransportError;
use meshcast_core::http::{FetchId, HttpEvent, HttpFetch, HttpTransport};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Timing of simulated origin responses.
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Delay before the first byte of every response
    pub latency: Duration,
    /// Size of each progress chunk
    pub chunk_size: usize,
    /// Delay between consecutive chunks
    pub chunk_delay: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(20),
            chunk_size: 16 * 1024,
            chunk_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct OriginState {
    bodies: HashMap<String, Bytes>,
    failing: HashSet<String>,
    requests: Vec<HttpFetch>,
    served_bytes: u64,
    tasks: HashMap<FetchId, JoinHandle<()>>,
}

/// In-process origin serving registered bodies by URL.
///
/// Unknown URLs answer `404`, failing URLs produce a network failure, and
/// `bytes=<start>-` or `bytes=<start>-<end>` ranges answer `206` with the
/// requested slice.
#[derive(Clone)]
pub struct SimulatedOrigin {
    config: OriginConfig,
    state: Arc<Mutex<OriginState>>,
    events: mpsc::UnboundedSender<HttpEvent>,
}

impl SimulatedOrigin {
    /// Creates an origin and the channel its events arrive on.
    pub fn new(config: OriginConfig) -> (Self, mpsc::UnboundedReceiver<HttpEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let origin = Self {
            config,
            state: Arc::new(Mutex::new(OriginState::default())),
            events,
        };
        (origin, receiver)
    }

    /// Creates another endpoint sharing this origin's content, with its own
    /// event channel.
    pub fn endpoint(&self) -> (Self, mpsc::UnboundedReceiver<HttpEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let endpoint = Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            events,
        };
        (endpoint, receiver)
    }

    pub fn insert(&self, url: impl Into<String>, body: Bytes) {
        self.state.lock().bodies.insert(url.into(), body);
    }

    /// Makes every request for `url` fail at the network level.
    pub fn fail_url(&self, url: impl Into<String>) {
        self.state.lock().failing.insert(url.into());
    }

    pub fn restore_url(&self, url: &str) {
        self.state.lock().failing.remove(url);
    }

    /// Requests received so far, across all endpoints.
    pub fn requests(&self) -> Vec<HttpFetch> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Body bytes sent so far, across all endpoints.
    pub fn served_bytes(&self) -> u64 {
        self.state.lock().served_bytes
    }
}

impl HttpTransport for SimulatedOrigin {
    fn start(&self, fetch: HttpFetch) -> Result<(), TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| TransportError::Network {
                reason: format!("No async runtime for simulated request: {e}"),
            })?;

        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let fetch_id = fetch.fetch_id;

        let mut guard = self.state.lock();
        guard.requests.push(fetch.clone());
        let handle = runtime.spawn(async move {
            tokio::time::sleep(config.latency).await;
            let event = serve(&config, &state, &events, &fetch).await;
            state.lock().tasks.remove(&fetch_id);
            let _ = events.send(event);
        });
        guard.tasks.insert(fetch_id, handle);
        Ok(())
    }

    fn abort(&self, fetch_id: FetchId) {
        if let Some(handle) = self.state.lock().tasks.remove(&fetch_id) {
            tracing::trace!(%fetch_id, "Simulated request aborted");
            handle.abort();
        }
    }
}

async fn serve(
    config: &OriginConfig,
    state: &Mutex<OriginState>,
    events: &mpsc::UnboundedSender<HttpEvent>,
    fetch: &HttpFetch,
) -> HttpEvent {
    let fetch_id = fetch.fetch_id;
    let lookup = {
        let state = state.lock();
        if state.failing.contains(&fetch.url) {
            None
        } else {
            Some(state.bodies.get(&fetch.url).cloned())
        }
    };

    let body = match lookup {
        None => {
            return HttpEvent::Failed {
                fetch_id,
                error: TransportError::Network {
                    reason: format!("Simulated connection reset: {}", fetch.url),
                },
            };
        }
        Some(None) => {
            return HttpEvent::Completed {
                fetch_id,
                status: 404,
                data: Bytes::new(),
                response_url: Some(fetch.url.clone()),
            };
        }
        Some(Some(body)) => body,
    };

    let (status, data) = match fetch.range.as_deref().and_then(|range| slice(&body, range)) {
        Some(data) => (206, data),
        None if fetch.range.is_some() => (416, Bytes::new()),
        None => (200, body),
    };

    for chunk in data.chunks(config.chunk_size.max(1)) {
        if !config.chunk_delay.is_zero() {
            tokio::time::sleep(config.chunk_delay).await;
        }
        let _ = events.send(HttpEvent::Progress {
            fetch_id,
            bytes: chunk.len(),
        });
    }
    state.lock().served_bytes += data.len() as u64;

    HttpEvent::Completed {
        fetch_id,
        status,
        data,
        response_url: Some(fetch.url.clone()),
    }
}

/// Applies a `bytes=<start>-[<end>]` range. Returns `None` for malformed or
/// unsatisfiable ranges.
fn slice(body: &Bytes, range: &str) -> Option<Bytes> {
    let spec = range.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => body.len().checked_sub(1)?,
        end => end.parse::<usize>().ok()?.min(body.len().checked_sub(1)?),
    };

    if start > end {
        return None;
    }
    Some(body.slice(start..=end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(id: u64, url: &str, range: Option<&str>) -> HttpFetch {
        HttpFetch {
            fetch_id: FetchId(id),
            segment_id: meshcast_core::SegmentId::new(format!("master+{id}")),
            url: url.to_string(),
            range: range.map(str::to_string),
        }
    }

    fn instant_origin() -> (SimulatedOrigin, mpsc::UnboundedReceiver<HttpEvent>) {
        SimulatedOrigin::new(OriginConfig {
            latency: Duration::ZERO,
            chunk_size: 4,
            chunk_delay: Duration::ZERO,
        })
    }

    async fn completion(receiver: &mut mpsc::UnboundedReceiver<HttpEvent>) -> (Vec<usize>, HttpEvent) {
        let mut progress = Vec::new();
        loop {
            match receiver.recv().await.unwrap() {
                HttpEvent::Progress { bytes, .. } => progress.push(bytes),
                event => return (progress, event),
            }
        }
    }

    #[test]
    fn test_range_slicing() {
        let body = Bytes::from_static(b"0123456789");

        assert_eq!(slice(&body, "bytes=4-").unwrap(), Bytes::from_static(b"456789"));
        assert_eq!(slice(&body, "bytes=2-4").unwrap(), Bytes::from_static(b"234"));
        assert_eq!(slice(&body, "bytes=8-100").unwrap(), Bytes::from_static(b"89"));
        assert!(slice(&body, "bytes=10-").is_none());
        assert!(slice(&body, "items=1-2").is_none());
        assert!(slice(&Bytes::new(), "bytes=0-").is_none());
    }

    #[tokio::test]
    async fn test_serves_body_in_chunks() {
        let (origin, mut events) = instant_origin();
        origin.insert("http://origin/1.ts", Bytes::from_static(b"0123456789"));

        origin.start(fetch(1, "http://origin/1.ts", None)).unwrap();
        let (progress, event) = completion(&mut events).await;

        assert_eq!(progress, vec![4, 4, 2]);
        assert!(matches!(
            event,
            HttpEvent::Completed { status: 200, ref data, .. } if data.len() == 10
        ));
        assert_eq!(origin.served_bytes(), 10);
        assert_eq!(origin.request_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_content_and_missing_urls() {
        let (origin, mut events) = instant_origin();
        origin.insert("http://origin/1.ts", Bytes::from_static(b"0123456789"));

        origin
            .start(fetch(1, "http://origin/1.ts", Some("bytes=6-")))
            .unwrap();
        let (_, event) = completion(&mut events).await;
        assert!(matches!(
            event,
            HttpEvent::Completed { status: 206, ref data, .. } if data.as_ref() == b"6789"
        ));

        origin.start(fetch(2, "http://origin/2.ts", None)).unwrap();
        let (_, event) = completion(&mut events).await;
        assert!(matches!(event, HttpEvent::Completed { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_failing_url_reports_network_error() {
        let (origin, mut events) = instant_origin();
        origin.insert("http://origin/1.ts", Bytes::from_static(b"data"));
        origin.fail_url("http://origin/1.ts");

        origin.start(fetch(7, "http://origin/1.ts", None)).unwrap();
        let (_, event) = completion(&mut events).await;

        assert!(matches!(
            event,
            HttpEvent::Failed { fetch_id: FetchId(7), error: TransportError::Network { .. } }
        ));
    }

    #[tokio::test]
    async fn test_endpoints_share_content() {
        let (origin, _events) = instant_origin();
        let (endpoint, mut endpoint_events) = origin.endpoint();
        origin.insert("http://origin/1.ts", Bytes::from_static(b"shared"));

        endpoint.start(fetch(1, "http://origin/1.ts", None)).unwrap();
        let (_, event) = completion(&mut endpoint_events).await;

        assert!(matches!(event, HttpEvent::Completed { status: 200, .. }));
        assert_eq!(origin.request_count(), 1);
    }
}

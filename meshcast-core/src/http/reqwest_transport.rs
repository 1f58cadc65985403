//! Production HTTP transport using reqwest

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{FetchId, HttpEvent, HttpFetch, HttpTransport};
use crate::config::HttpConfig;
use crate::error::TransportError;

/// Runs each request on its own task and streams events back.
pub struct ReqwestTransport {
    client: reqwest::Client,
    events: mpsc::UnboundedSender<HttpEvent>,
    tasks: Arc<Mutex<HashMap<FetchId, JoinHandle<()>>>>,
}

impl ReqwestTransport {
    /// Creates the transport and the channel its events arrive on.
    ///
    /// # Errors
    ///
    /// - `TransportError::Network` - If the HTTP client cannot be built
    pub fn new(
        config: &HttpConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HttpEvent>), TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| TransportError::Network {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        let (events, receiver) = mpsc::unbounded_channel();
        Ok((
            Self {
                client,
                events,
                tasks: Arc::new(Mutex::new(HashMap::new())),
            },
            receiver,
        ))
    }

    /// Number of requests still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl HttpTransport for ReqwestTransport {
    fn start(&self, fetch: HttpFetch) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| TransportError::Network {
            reason: format!("No async runtime for HTTP request: {e}"),
        })?;

        let client = self.client.clone();
        let events = self.events.clone();
        let tasks = Arc::clone(&self.tasks);
        let fetch_id = fetch.fetch_id;

        // Registered under the lock so the task cannot deregister first
        let mut running = self.tasks.lock();
        let handle = runtime.spawn(async move {
            let event = match fetch_segment(&client, &fetch, &events).await {
                Ok((status, data, response_url)) => HttpEvent::Completed {
                    fetch_id,
                    status,
                    data,
                    response_url,
                },
                Err(error) => HttpEvent::Failed { fetch_id, error },
            };

            tasks.lock().remove(&fetch_id);
            let _ = events.send(event);
        });
        running.insert(fetch_id, handle);
        Ok(())
    }

    fn abort(&self, fetch_id: FetchId) {
        if let Some(handle) = self.tasks.lock().remove(&fetch_id) {
            handle.abort();
        }
    }
}

impl Drop for ReqwestTransport {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

async fn fetch_segment(
    client: &reqwest::Client,
    fetch: &HttpFetch,
    events: &mpsc::UnboundedSender<HttpEvent>,
) -> Result<(u16, Bytes, Option<String>), TransportError> {
    let mut request = client.get(&fetch.url);
    if let Some(range) = &fetch.range {
        request = request.header(reqwest::header::RANGE, range);
    }

    let mut response = request.send().await.map_err(|e| {
        let reason = if e.is_timeout() {
            format!("Request timed out: {}", fetch.url)
        } else if e.is_connect() {
            format!("Failed to connect: {}", fetch.url)
        } else {
            format!("HTTP request failed: {e}")
        };
        TransportError::Network { reason }
    })?;

    let status = response.status().as_u16();
    let response_url = Some(response.url().to_string());
    if !response.status().is_success() {
        return Ok((status, Bytes::new(), response_url));
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| TransportError::Network {
        reason: format!("Failed to read response body: {e}"),
    })? {
        let _ = events.send(HttpEvent::Progress {
            fetch_id: fetch.fetch_id,
            bytes: chunk.len(),
        });
        body.extend_from_slice(&chunk);
    }

    Ok((status, body.freeze(), response_url))
}

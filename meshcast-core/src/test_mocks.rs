//! Mock collaborators for testing the loader engine.
//!
//! Transports record every call and never perform I/O; tests feed the
//! matching events back by hand.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::http::{FetchId, HttpFetch, HttpTransport};
use crate::random::RandomSource;
use crate::swarm::{AnnounceRequest, ConnectionId, SwarmId, SwarmTransport, TrackerTeardown};

#[derive(Debug, Default)]
struct HttpRecord {
    started: Vec<HttpFetch>,
    aborted: Vec<FetchId>,
    fail_starts: bool,
}

/// Records HTTP requests instead of issuing them.
#[derive(Debug, Clone, Default)]
pub struct MockHttpTransport {
    record: Arc<Mutex<HttpRecord>>,
}

impl MockHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request started so far, in order.
    pub fn started(&self) -> Vec<HttpFetch> {
        self.record.lock().started.clone()
    }

    /// Most recent request for a URL.
    pub fn last_fetch_for(&self, url: &str) -> Option<HttpFetch> {
        self.record
            .lock()
            .started
            .iter()
            .rev()
            .find(|fetch| fetch.url == url)
            .cloned()
    }

    pub fn aborted(&self) -> Vec<FetchId> {
        self.record.lock().aborted.clone()
    }

    /// Makes subsequent `start` calls fail.
    pub fn fail_starts(&self, fail: bool) {
        self.record.lock().fail_starts = fail;
    }
}

impl HttpTransport for MockHttpTransport {
    fn start(&self, fetch: HttpFetch) -> Result<(), TransportError> {
        let mut record = self.record.lock();
        if record.fail_starts {
            return Err(TransportError::Network {
                reason: format!("mock refused {}", fetch.url),
            });
        }
        record.started.push(fetch);
        Ok(())
    }

    fn abort(&self, fetch_id: FetchId) {
        self.record.lock().aborted.push(fetch_id);
    }
}

/// A call made on `MockSwarmTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmCall {
    Announce(AnnounceRequest),
    StopAnnounce(SwarmId, TrackerTeardown),
    Send(ConnectionId, Bytes),
    Close(ConnectionId),
}

/// Records swarm transport calls.
#[derive(Debug, Clone, Default)]
pub struct MockSwarmTransport {
    calls: Arc<Mutex<Vec<SwarmCall>>>,
}

impl MockSwarmTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SwarmCall> {
        self.calls.lock().clone()
    }

    /// Frames written to one connection, in order.
    pub fn sent_to(&self, connection: ConnectionId) -> Vec<Bytes> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SwarmCall::Send(target, frame) if *target == connection => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl SwarmTransport for MockSwarmTransport {
    fn announce(&self, request: AnnounceRequest) -> Result<(), TransportError> {
        self.calls.lock().push(SwarmCall::Announce(request));
        Ok(())
    }

    fn stop_announce(&self, swarm_id: SwarmId, teardown: TrackerTeardown) {
        self.calls
            .lock()
            .push(SwarmCall::StopAnnounce(swarm_id, teardown));
    }

    fn send(&self, connection: ConnectionId, frame: Bytes) -> Result<(), TransportError> {
        self.calls.lock().push(SwarmCall::Send(connection, frame));
        Ok(())
    }

    fn close(&self, connection: ConnectionId) {
        self.calls.lock().push(SwarmCall::Close(connection));
    }
}

/// Replays fixed random draws.
///
/// Falls back to `0.0` and index `0` once a script runs out.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRandom {
    units: VecDeque<f64>,
    indices: VecDeque<usize>,
}

impl ScriptedRandom {
    pub fn new(units: Vec<f64>, indices: Vec<usize>) -> Self {
        Self {
            units: units.into(),
            indices: indices.into(),
        }
    }
}

impl RandomSource for ScriptedRandom {
    fn next_unit(&mut self) -> f64 {
        self.units.pop_front().unwrap_or(0.0)
    }

    fn next_index(&mut self, len: usize) -> usize {
        self.indices.pop_front().unwrap_or(0).min(len.saturating_sub(1))
    }
}

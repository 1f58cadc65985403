//! Shared fixtures: engines wired to one simulated origin and network.

use std::sync::Arc;
use std::time::Duration;

use meshcast_core::swarm::PeerId;
use meshcast_core::{LoaderBuilder, LoaderConfig, LoaderHandle, LoaderNotification, Segment};
use meshcast_sim::{NetworkConfig, OriginConfig, Playlist, SimulatedNetwork, SimulatedOrigin};
use tokio::sync::broadcast;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub struct Bench {
    pub origin: SimulatedOrigin,
    pub network: SimulatedNetwork,
    pub playlist: Playlist,
}

pub struct Node {
    pub handle: LoaderHandle,
    pub notifications: broadcast::Receiver<LoaderNotification>,
    pub peer_id: PeerId,
}

impl Bench {
    pub fn new(network: NetworkConfig) -> Self {
        init_test_tracing();

        let (origin, _events) = SimulatedOrigin::new(OriginConfig {
            latency: Duration::from_millis(1),
            ..OriginConfig::default()
        });
        let playlist = Playlist::new("stream", 8, 4096).with_seed(3);
        playlist.publish(&origin);

        Self {
            origin,
            network: SimulatedNetwork::new(network),
            playlist,
        }
    }

    /// Spawns an engine on this bench with its own seed.
    pub async fn node(&self, mut config: LoaderConfig, seed: u64) -> Node {
        config.scheduling.deterministic_seed = Some(seed);
        let (http, http_events) = self.origin.endpoint();
        let (swarm, swarm_events) = self.network.join();

        let handle = LoaderBuilder::new(config)
            .spawn(Arc::new(http), http_events, Arc::new(swarm), swarm_events)
            .unwrap();
        let notifications = handle.subscribe();
        let peer_id = handle.peer_id().await.unwrap();

        Node {
            handle,
            notifications,
            peer_id,
        }
    }

    pub fn segment(&self, index: usize, priority: i32) -> Segment {
        self.playlist.segment(index, priority)
    }

    pub async fn load(&self, node: &Node, segments: Vec<Segment>) {
        node.handle
            .load(segments, &self.playlist.stream_swarm_id())
            .await
            .unwrap();
    }
}

/// Configuration that never samples HTTP for non-required segments.
pub fn peer_first() -> LoaderConfig {
    let mut config = LoaderConfig::for_testing();
    config.http.download_probability = 0.0;
    config
}

/// Waits for the first notification matching `predicate`, skipping others.
pub async fn wait_for<F>(
    notifications: &mut broadcast::Receiver<LoaderNotification>,
    predicate: F,
) -> LoaderNotification
where
    F: Fn(&LoaderNotification) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match notifications.recv().await {
                Ok(notification) if predicate(&notification) => return notification,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("notification channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

/// Collects everything published within `window`.
pub async fn collect_for(
    notifications: &mut broadcast::Receiver<LoaderNotification>,
    window: Duration,
) -> Vec<LoaderNotification> {
    let mut received = Vec::new();
    let _ = tokio::time::timeout(window, async {
        while let Ok(notification) = notifications.recv().await {
            received.push(notification);
        }
    })
    .await;
    received
}

//! Multi-viewer playback over a simulated origin and network.

use std::sync::Arc;
use std::time::Duration;

use meshcast_core::engine::LoaderBuilder;
use meshcast_core::swarm::PeerId;
use meshcast_core::{LoaderConfig, LoaderError, LoaderHandle, LoaderNotification, SegmentId};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::origin::{OriginConfig, SimulatedOrigin};
use crate::playlist::Playlist;

/// Errors from running a simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Viewer {viewer} task failed: {reason}")]
    Viewer { viewer: usize, reason: String },
}

/// Shape of a simulation run.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub viewers: usize,
    pub segments: usize,
    pub segment_size: usize,
    /// Segments queued ahead of the playhead, including it
    pub window: usize,
    pub seed: u64,
    /// Playback time of one segment
    pub segment_duration: Duration,
    /// Delay between consecutive viewers joining
    pub stagger: Duration,
    /// Longest wait for the playhead segment before counting a stall
    pub stall_timeout: Duration,
    pub origin: OriginConfig,
    pub network: NetworkConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            viewers: 3,
            segments: 20,
            segment_size: 64 * 1024,
            window: 6,
            seed: 1,
            segment_duration: Duration::from_millis(200),
            stagger: Duration::from_millis(600),
            stall_timeout: Duration::from_secs(5),
            origin: OriginConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// What one viewer downloaded and served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerReport {
    pub viewer: usize,
    pub peer_id: Option<PeerId>,
    pub http_bytes: u64,
    pub p2p_bytes: u64,
    pub uploaded_bytes: u64,
    pub segments_played: usize,
    pub stalls: usize,
    pub segment_errors: usize,
    pub peers_connected: usize,
}

impl ViewerReport {
    /// Share of downloaded bytes that came from peers, in `[0, 1]`.
    pub fn p2p_ratio(&self) -> f64 {
        let total = self.http_bytes + self.p2p_bytes;
        if total == 0 {
            return 0.0;
        }
        self.p2p_bytes as f64 / total as f64
    }

    fn record(&mut self, notification: &LoaderNotification) {
        match notification {
            LoaderNotification::SegmentLoaded { segment, peer_id } => {
                let bytes = segment.data.as_ref().map_or(0, |data| data.len() as u64);
                if peer_id.is_some() {
                    self.p2p_bytes += bytes;
                } else {
                    self.http_bytes += bytes;
                }
            }
            LoaderNotification::SegmentError { .. } => self.segment_errors += 1,
            LoaderNotification::PeerConnect { .. } => self.peers_connected += 1,
            LoaderNotification::BytesUploaded { bytes, .. } => self.uploaded_bytes += *bytes as u64,
            LoaderNotification::SegmentAbort { .. } | LoaderNotification::PeerClose { .. } => {}
        }
    }
}

/// Runs every viewer through the whole playlist and reports per viewer, in
/// viewer order.
///
/// Each viewer gets its own engine built from `loader` with a distinct seed,
/// sharing one origin and one network.
///
/// # Errors
///
/// - `SimulationError::Loader` - If an engine cannot be built or fails
/// - `SimulationError::Viewer` - If a viewer task panics
pub async fn run_scenario(
    config: &ScenarioConfig,
    loader: &LoaderConfig,
) -> Result<Vec<ViewerReport>, SimulationError> {
    let playlist = Playlist::new("sim", config.segments, config.segment_size).with_seed(config.seed);
    let (origin, _origin_events) = SimulatedOrigin::new(config.origin.clone());
    playlist.publish(&origin);
    let network = SimulatedNetwork::new(config.network);

    tracing::info!(
        viewers = config.viewers,
        segments = config.segments,
        segment_size = config.segment_size,
        "Starting simulation"
    );

    let mut tasks = Vec::with_capacity(config.viewers);
    for viewer in 0..config.viewers {
        let mut loader = loader.clone();
        loader.scheduling.deterministic_seed = Some(config.seed.wrapping_add(viewer as u64));

        let (http, http_events) = origin.endpoint();
        let (swarm, swarm_events) = network.join();
        let handle = LoaderBuilder::new(loader).spawn(
            Arc::new(http),
            http_events,
            Arc::new(swarm),
            swarm_events,
        )?;

        let playlist = playlist.clone();
        let config = config.clone();
        let start_delay = config.stagger * viewer as u32;
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(start_delay).await;
            let report = play(viewer, &handle, &playlist, &config).await;
            if let Err(e) = handle.destroy().await {
                tracing::warn!(viewer, error = %e, "Failed to destroy viewer engine");
            }
            report
        }));
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for (viewer, result) in futures::future::join_all(tasks).await.into_iter().enumerate() {
        let report = result.map_err(|e| SimulationError::Viewer {
            viewer,
            reason: e.to_string(),
        })??;
        reports.push(report);
    }

    tracing::info!(
        origin_bytes = origin.served_bytes(),
        peer_bytes = network.bytes_delivered(),
        "Simulation finished"
    );
    Ok(reports)
}

async fn play(
    viewer: usize,
    handle: &LoaderHandle,
    playlist: &Playlist,
    config: &ScenarioConfig,
) -> Result<ViewerReport, SimulationError> {
    let mut notifications = handle.subscribe();
    let mut report = ViewerReport {
        viewer,
        peer_id: Some(handle.peer_id().await?),
        ..ViewerReport::default()
    };
    let stream_swarm_id = playlist.stream_swarm_id();

    for playhead in 0..playlist.len() {
        handle
            .load(playlist.window(playhead, config.window), &stream_swarm_id)
            .await?;

        let id = playlist.segment(playhead, 0).id;
        let deadline = Instant::now() + config.stall_timeout;
        if wait_for_segment(handle, &id, &mut notifications, &mut report, deadline).await? {
            report.segments_played += 1;
        } else {
            tracing::debug!(viewer, segment_id = %id, "Playback stalled");
            report.stalls += 1;
        }

        tokio::time::sleep(config.segment_duration).await;
        drain(&mut notifications, &mut report);
    }

    tracing::debug!(viewer, ?report, "Viewer finished");
    Ok(report)
}

async fn wait_for_segment(
    handle: &LoaderHandle,
    id: &SegmentId,
    notifications: &mut broadcast::Receiver<LoaderNotification>,
    report: &mut ViewerReport,
    deadline: Instant,
) -> Result<bool, SimulationError> {
    loop {
        drain(notifications, report);
        if handle.segment(id).await?.is_some() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain(notifications: &mut broadcast::Receiver<LoaderNotification>, report: &mut ViewerReport) {
    loop {
        match notifications.try_recv() {
            Ok(notification) => report.record(&notification),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                tracing::warn!(viewer = report.viewer, missed, "Notifications lagged");
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_scenario(viewers: usize) -> ScenarioConfig {
        ScenarioConfig {
            viewers,
            segments: 6,
            segment_size: 2048,
            window: 4,
            segment_duration: Duration::from_millis(20),
            stagger: Duration::from_millis(50),
            origin: OriginConfig {
                latency: Duration::from_millis(2),
                ..OriginConfig::default()
            },
            ..ScenarioConfig::default()
        }
    }

    #[test]
    fn test_p2p_ratio() {
        let report = ViewerReport {
            http_bytes: 300,
            p2p_bytes: 100,
            ..ViewerReport::default()
        };
        assert_eq!(report.p2p_ratio(), 0.25);
        assert_eq!(ViewerReport::default().p2p_ratio(), 0.0);
    }

    #[tokio::test]
    async fn test_single_viewer_plays_everything_over_http() {
        let config = small_scenario(1);

        let reports = run_scenario(&config, &LoaderConfig::for_testing())
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.segments_played, 6);
        assert_eq!(report.stalls, 0);
        assert_eq!(report.p2p_bytes, 0);
        assert_eq!(report.http_bytes, 6 * 2048);
        assert!(report.peer_id.is_some());
    }

    #[tokio::test]
    async fn test_viewers_get_distinct_peer_ids() {
        let config = small_scenario(2);

        let reports = run_scenario(&config, &LoaderConfig::for_testing())
            .await
            .unwrap();

        assert_eq!(reports[0].viewer, 0);
        assert_eq!(reports[1].viewer, 1);
        assert_ne!(reports[0].peer_id, reports[1].peer_id);
        for report in &reports {
            assert_eq!(report.segments_played, 6);
        }
    }
}

//! Handle for communicating with the loader actor.

use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::{LoaderCommand, LoaderStats};
use crate::LoaderError;
use crate::config::LoaderConfig;
use crate::notification::LoaderNotification;
use crate::segment::{Segment, SegmentId};
use crate::swarm::PeerId;

/// Handle for communicating with the loader actor.
///
/// Cheap to clone and safe to share across tasks. Every call is answered by
/// the actor in submission order.
#[derive(Clone)]
pub struct LoaderHandle {
    sender: mpsc::Sender<LoaderCommand>,
    notifications: broadcast::Sender<LoaderNotification>,
}

impl LoaderHandle {
    /// Creates a new handle with the given command sender.
    pub fn new(
        sender: mpsc::Sender<LoaderCommand>,
        notifications: broadcast::Sender<LoaderNotification>,
    ) -> Self {
        Self {
            sender,
            notifications,
        }
    }

    /// Replaces the segment queue.
    ///
    /// Segments are in playback order; the first one determines the master
    /// swarm. Segments missing from the new queue are aborted.
    ///
    /// # Errors
    /// - `LoaderError::EngineShutdown` - The loader was destroyed
    /// - `LoaderError::Storage` - The segment cache failed
    pub async fn load(&self, queue: Vec<Segment>, stream_swarm_id: &str) -> crate::Result<()> {
        let (responder, rx) = oneshot::channel();
        let cmd = LoaderCommand::Load {
            queue,
            stream_swarm_id: stream_swarm_id.to_string(),
            responder,
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| LoaderError::EngineShutdown)?;

        rx.await.map_err(|_| LoaderError::EngineShutdown)?
    }

    /// Looks up a downloaded segment.
    ///
    /// Returns `None` before the first `load` or when the segment is not
    /// cached.
    ///
    /// # Errors
    /// - `LoaderError::EngineShutdown` - The loader was destroyed
    /// - `LoaderError::Storage` - The segment cache failed
    pub async fn segment(&self, segment_id: &SegmentId) -> crate::Result<Option<Segment>> {
        let (responder, rx) = oneshot::channel();
        let cmd = LoaderCommand::GetSegment {
            segment_id: segment_id.clone(),
            responder,
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| LoaderError::EngineShutdown)?;

        rx.await.map_err(|_| LoaderError::EngineShutdown)?
    }

    /// Returns the effective configuration.
    ///
    /// # Errors
    /// - `LoaderError::EngineShutdown` - The loader was destroyed
    pub async fn settings(&self) -> crate::Result<LoaderConfig> {
        let (responder, rx) = oneshot::channel();

        self.sender
            .send(LoaderCommand::GetSettings { responder })
            .await
            .map_err(|_| LoaderError::EngineShutdown)?;

        rx.await.map_err(|_| LoaderError::EngineShutdown)
    }

    /// Returns the local peer id.
    ///
    /// # Errors
    /// - `LoaderError::EngineShutdown` - The loader was destroyed
    pub async fn peer_id(&self) -> crate::Result<PeerId> {
        let (responder, rx) = oneshot::channel();

        self.sender
            .send(LoaderCommand::GetPeerId { responder })
            .await
            .map_err(|_| LoaderError::EngineShutdown)?;

        rx.await.map_err(|_| LoaderError::EngineShutdown)
    }

    /// Returns current activity counters.
    ///
    /// # Errors
    /// - `LoaderError::EngineShutdown` - The loader was destroyed
    pub async fn stats(&self) -> crate::Result<LoaderStats> {
        let (responder, rx) = oneshot::channel();

        self.sender
            .send(LoaderCommand::GetStats { responder })
            .await
            .map_err(|_| LoaderError::EngineShutdown)?;

        rx.await.map_err(|_| LoaderError::EngineShutdown)
    }

    /// Cancels all transfers, leaves the swarm, empties the cache and stops
    /// the actor. Succeeds if the loader is already gone.
    ///
    /// # Errors
    /// - `LoaderError::Storage` - The segment cache failed to clear
    pub async fn destroy(&self) -> crate::Result<()> {
        let (responder, rx) = oneshot::channel();

        if self
            .sender
            .send(LoaderCommand::Destroy { responder })
            .await
            .is_err()
        {
            return Ok(());
        }

        rx.await.unwrap_or(Ok(()))
    }

    /// Subscribes to loader notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderNotification> {
        self.notifications.subscribe()
    }

    /// Whether the actor is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

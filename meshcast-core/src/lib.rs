//! Meshcast Core - Hybrid HTTP/P2P segment delivery
//!
//! This crate provides the scheduling and peer-protocol engine that lets a
//! media player fetch playback segments from an HTTP origin or from a swarm
//! of peers: segment cache, bandwidth approximation, the peer wire protocol,
//! swarm coordination, the HTTP downloader, the scheduler, and the actor
//! engine that ties them together.

pub mod bandwidth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod notification;
pub mod protocol;
pub mod random;
pub mod scheduler;
pub mod segment;
pub mod storage;
pub mod swarm;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;
pub mod tracing_setup;
pub mod validation;

// Re-export main types for convenient access
pub use bandwidth::BandwidthApproximator;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::LoaderConfig;
pub use engine::{LoaderBuilder, LoaderHandle, LoaderStats};
pub use error::{ErrorKind, SegmentError, TransportError};
pub use notification::LoaderNotification;
pub use protocol::ProtocolError;
pub use scheduler::Scheduler;
pub use segment::{DownloadMethod, Segment, SegmentId, SegmentStatus};
pub use storage::{MemorySegmentsStorage, SegmentsStorage, StorageError};
pub use swarm::{PeerId, SwarmCoordinator, SwarmId};
pub use validation::{SegmentUrlBuilder, SegmentValidator, ValidationError};

/// Errors that can bubble up from any Meshcast subsystem.
///
/// Segment-level failures never reach this type: they are recovered inside
/// the engine and surfaced as `segment-error` notifications instead.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Peer protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Loader engine has shut down")]
    EngineShutdown,
}

impl LoaderError {
    /// Checks if this error is caused by invalid caller input.
    pub fn is_user_error(&self) -> bool {
        matches!(self, LoaderError::Configuration { .. })
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;

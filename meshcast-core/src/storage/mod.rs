//! Storage layer for downloaded segments.
//!
//! Defines the pluggable storage interface the scheduler and the swarm
//! coordinator consult, with an in-memory LRU implementation.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
pub use memory::MemorySegmentsStorage;

use crate::segment::{Segment, SegmentId};

/// Predicate marking segments that must survive a clean.
pub type LockedFilter<'a> = &'a (dyn Fn(&SegmentId) -> bool + Send + Sync);

/// Segment storage operations.
///
/// Implementations may be backed by memory or a durable store. All calls are
/// made from the engine task, one at a time.
#[async_trait]
pub trait SegmentsStorage: Send + Sync {
    /// Inserts or overwrites a downloaded segment.
    ///
    /// # Errors
    ///
    /// - `StorageError::MissingData` - If the segment carries no bytes
    /// - `StorageError::Backend` - If the backing store rejected the write
    async fn store_segment(&self, segment: Segment) -> Result<(), StorageError>;

    /// Returns every stored segment of one master swarm keyed by id.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the backing store could not be read
    async fn segments_map(
        &self,
        master_swarm_id: &str,
    ) -> Result<HashMap<SegmentId, Segment>, StorageError>;

    /// Looks up one segment and marks it as recently used.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the backing store could not be read
    async fn segment(
        &self,
        id: &SegmentId,
        master_swarm_id: &str,
    ) -> Result<Option<Segment>, StorageError>;

    /// Evicts expired entries, then least recently used unlocked entries
    /// until the store is within capacity.
    ///
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the backing store could not be modified
    async fn clean(
        &self,
        master_swarm_id: &str,
        locked: LockedFilter<'_>,
    ) -> Result<bool, StorageError>;

    /// Drops every entry.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the backing store could not be cleared
    async fn destroy(&self) -> Result<(), StorageError>;
}

/// Errors that occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Only downloaded segments can be stored
    #[error("Segment {segment_id} has no data to store")]
    MissingData { segment_id: SegmentId },

    /// Backend-specific failure
    #[error("Storage backend failure: {reason}")]
    Backend { reason: String },
}

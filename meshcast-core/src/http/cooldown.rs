//! Retry cooldown for segments whose HTTP download failed.

use std::collections::HashMap;
use std::time::Instant;

use crate::segment::SegmentId;

/// Segments barred from HTTP until a deadline.
#[derive(Debug, Default)]
pub struct FailedSegmentRegistry {
    until: HashMap<SegmentId, Instant>,
}

impl FailedSegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bars `segment_id` from HTTP until `until`.
    pub fn mark_failed(&mut self, segment_id: SegmentId, until: Instant) {
        self.until.insert(segment_id, until);
    }

    pub fn is_failed(&self, segment_id: &SegmentId, now: Instant) -> bool {
        self.until
            .get(segment_id)
            .is_some_and(|until| *until > now)
    }

    /// Drops entries whose cooldown has elapsed.
    pub fn purge_expired(&mut self, now: Instant) {
        self.until.retain(|_, until| *until > now);
    }

    pub fn len(&self) -> usize {
        self.until.len()
    }

    pub fn is_empty(&self) -> bool {
        self.until.is_empty()
    }
}

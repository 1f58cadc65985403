//! Segment availability maps and their wire encoding.
//!
//! On the wire, availability is grouped by stream swarm id: the sequences of
//! one swarm are joined with `|` into a single string paired with a parallel
//! array of status codes.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::ProtocolError;
use crate::segment::{SegmentId, SegmentStatus};

/// Which segments one peer (or the whole swarm) can offer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityMap {
    segments: HashMap<SegmentId, SegmentStatus>,
}

impl AvailabilityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, id: &SegmentId) -> Option<SegmentStatus> {
        self.segments.get(id).copied()
    }

    /// Whether `id` is advertised as fully held.
    pub fn is_loaded(&self, id: &SegmentId) -> bool {
        self.status(id) == Some(SegmentStatus::Loaded)
    }

    pub fn contains(&self, id: &SegmentId) -> bool {
        self.segments.contains_key(id)
    }

    pub fn insert(&mut self, id: SegmentId, status: SegmentStatus) {
        self.segments.insert(id, status);
    }

    /// Merges one entry, letting `Loaded` win over `LoadingByHttp`.
    pub fn merge(&mut self, id: &SegmentId, status: SegmentStatus) {
        match self.segments.get(id) {
            Some(SegmentStatus::Loaded) => {}
            _ => {
                self.segments.insert(id.clone(), status);
            }
        }
    }

    pub fn remove(&mut self, id: &SegmentId) -> Option<SegmentStatus> {
        self.segments.remove(id)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SegmentId, SegmentStatus)> {
        self.segments.iter().map(|(id, status)| (id, *status))
    }
}

/// Wire form of an availability map: stream swarm id to
/// `("seq1|seq2|...", [status, status, ...])`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentsMapPayload(BTreeMap<String, (String, Vec<u8>)>);

impl SegmentsMapPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one segment under its stream swarm id.
    pub fn push(&mut self, stream_swarm_id: &str, sequence: &str, status: SegmentStatus) {
        let (sequences, statuses) = self.0.entry(stream_swarm_id.to_string()).or_default();
        if !statuses.is_empty() {
            sequences.push('|');
        }
        sequences.push_str(sequence);
        statuses.push(status.code());
    }

    /// Number of segments advertised across all swarms.
    pub fn segment_count(&self) -> usize {
        self.0.values().map(|(_, statuses)| statuses.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segment_count() == 0
    }

    /// Parses the `m` field of a segments-map command.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MalformedSegmentsMap` - If the value is not an object of `[string, [codes]]` pairs
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedSegmentsMap {
            reason: e.to_string(),
        })
    }

    /// Expands the payload into segment ids.
    ///
    /// The whole payload is rejected if any swarm entry is inconsistent, so a
    /// peer's map is either fully replaced or cleared.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MalformedSegmentsMap` - If sequence and status counts differ or a status code is unknown
    pub fn to_availability(&self) -> Result<AvailabilityMap, ProtocolError> {
        let mut map = AvailabilityMap::new();

        for (stream_swarm_id, (sequences, statuses)) in &self.0 {
            // An empty string is one empty sequence, never zero sequences
            let sequences: Vec<&str> = sequences.split('|').collect();

            if sequences.len() != statuses.len() {
                return Err(ProtocolError::MalformedSegmentsMap {
                    reason: format!(
                        "swarm {stream_swarm_id} lists {} sequences but {} statuses",
                        sequences.len(),
                        statuses.len()
                    ),
                });
            }

            for (sequence, code) in sequences.into_iter().zip(statuses) {
                let status = SegmentStatus::from_code(u64::from(*code)).ok_or_else(|| {
                    ProtocolError::MalformedSegmentsMap {
                        reason: format!("unknown segment status {code}"),
                    }
                })?;
                map.insert(SegmentId::in_swarm(stream_swarm_id, sequence), status);
            }
        }

        Ok(map)
    }
}

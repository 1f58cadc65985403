//! Synthetic live playlist.

use bytes::Bytes;
use meshcast_core::Segment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::origin::SimulatedOrigin;

/// A fixed list of segments with deterministic bodies.
///
/// Segment `n` has sequence `n`, lives at `<base_url>/<master>/<n>.ts`, and
/// its body depends only on the playlist seed and `n`.
#[derive(Debug, Clone)]
pub struct Playlist {
    master_swarm_id: String,
    stream_id: Option<String>,
    base_url: String,
    segments: usize,
    segment_size: usize,
    seed: u64,
}

impl Playlist {
    pub fn new(master_swarm_id: impl Into<String>, segments: usize, segment_size: usize) -> Self {
        Self {
            master_swarm_id: master_swarm_id.into(),
            stream_id: None,
            base_url: "http://origin.sim".to_string(),
            segments,
            segment_size,
            seed: 0,
        }
    }

    /// Places segments in a variant stream of the master playlist.
    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn len(&self) -> usize {
        self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments == 0
    }

    /// Grouping key engines join for this playlist.
    pub fn stream_swarm_id(&self) -> String {
        match &self.stream_id {
            Some(stream_id) => format!("{}+{stream_id}", self.master_swarm_id),
            None => self.master_swarm_id.clone(),
        }
    }

    pub fn url(&self, index: usize) -> String {
        format!("{}/{}/{index}.ts", self.base_url, self.stream_swarm_id())
    }

    pub fn body(&self, index: usize) -> Bytes {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ (index as u64).rotate_left(32));
        let mut body = vec![0u8; self.segment_size];
        rng.fill_bytes(&mut body);
        Bytes::from(body)
    }

    pub fn segment(&self, index: usize, priority: i32) -> Segment {
        Segment::new(
            self.master_swarm_id.as_str(),
            self.stream_id.as_deref(),
            index.to_string(),
            self.url(index),
        )
        .with_priority(priority)
    }

    /// Queue for a viewer at `playhead`: up to `size` segments starting at
    /// the playhead, with priorities counting up from 0.
    pub fn window(&self, playhead: usize, size: usize) -> Vec<Segment> {
        (playhead..self.segments.min(playhead.saturating_add(size)))
            .zip(0..)
            .map(|(index, priority)| self.segment(index, priority))
            .collect()
    }

    /// Registers every segment body with the origin.
    pub fn publish(&self, origin: &SimulatedOrigin) {
        for index in 0..self.segments {
            origin.insert(self.url(index), self.body(index));
        }
    }
}

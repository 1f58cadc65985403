//! Segment scheduling: decides, per queued segment, whether to fetch it over
//! HTTP or from peers.
//!
//! The scheduler is a single-threaded state machine. Every entry point runs
//! to completion before the next one starts, so a reconcile pass never
//! observes half-applied events. Timers are not armed here: the caller polls
//! `next_deadline` and invokes `poll_timers`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::bandwidth::BandwidthApproximator;
use crate::clock::SharedClock;
use crate::config::LoaderConfig;
use crate::error::SegmentError;
use crate::http::{HttpDownloader, HttpEvent, HttpNotice};
use crate::notification::LoaderNotification;
use crate::protocol::SegmentsMapPayload;
use crate::random::RandomSource;
use crate::segment::{DownloadMethod, Segment, SegmentId, SegmentStatus};
use crate::storage::SegmentsStorage;
use crate::swarm::{PeerId, SwarmCoordinator, SwarmEvent, SwarmNotice};


/// Capacity of the notification broadcast channel.
pub const NOTIFICATION_CAPACITY: usize = 256;

/// Delay added before the first startup-phase check.
const INITIAL_CHECK_SLACK: Duration = Duration::from_millis(100);

/// Startup phase during which early segments are pulled from peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitialPhase {
    /// The first `load` has not happened yet
    Pending,
    Active {
        started_at: Instant,
        next_check: Instant,
    },
    Finished,
}

/// Orchestrates HTTP and P2P downloads for the active queue.
pub struct Scheduler {
    config: LoaderConfig,
    clock: SharedClock,
    random: Box<dyn RandomSource>,
    storage: Arc<dyn SegmentsStorage>,
    http: HttpDownloader,
    swarm: SwarmCoordinator,
    bandwidth: BandwidthApproximator,
    queue: Vec<Segment>,
    master_swarm_id: Option<String>,
    sampler_next: Option<Instant>,
    timers_started: bool,
    initial_phase: InitialPhase,
    destroyed: bool,
    notifications: broadcast::Sender<LoaderNotification>,
}

impl Scheduler {
    pub fn new(
        config: LoaderConfig,
        clock: SharedClock,
        random: Box<dyn RandomSource>,
        storage: Arc<dyn SegmentsStorage>,
        http: HttpDownloader,
        swarm: SwarmCoordinator,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let bandwidth = BandwidthApproximator::new(clock.now());

        Self {
            config,
            clock,
            random,
            storage,
            http,
            swarm,
            bandwidth,
            queue: Vec::new(),
            master_swarm_id: None,
            sampler_next: None,
            timers_started: false,
            initial_phase: InitialPhase::Pending,
            destroyed: false,
            notifications,
        }
    }

    /// Subscribes to loader notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderNotification> {
        self.notifications.subscribe()
    }

    /// Sender side of the notification channel.
    pub fn notification_sender(&self) -> broadcast::Sender<LoaderNotification> {
        self.notifications.clone()
    }

    /// Effective configuration.
    pub fn settings(&self) -> &LoaderConfig {
        &self.config
    }

    /// Local peer id.
    pub fn peer_id(&self) -> PeerId {
        self.swarm.peer_id()
    }

    /// Current time on the loader's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Active queue, in playback order.
    pub fn queue(&self) -> &[Segment] {
        &self.queue
    }

    pub fn http(&self) -> &HttpDownloader {
        &self.http
    }

    pub fn swarm(&self) -> &SwarmCoordinator {
        &self.swarm
    }

    /// Whether the startup phase currently restricts HTTP.
    pub fn is_initial_phase_active(&self) -> bool {
        matches!(self.initial_phase, InitialPhase::Active { .. })
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Replaces the active queue.
    ///
    /// Segments dropped from the queue have their transfer aborted and
    /// a `segment-abort` notification raised.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Storage` - If the segment cache fails
    pub async fn load(&mut self, queue: Vec<Segment>, stream_swarm_id: &str) -> crate::Result<()> {
        if self.destroyed {
            return Err(crate::LoaderError::EngineShutdown);
        }

        let now = self.clock.now();
        self.start_timers(now);

        if let Some(first) = queue.first() {
            self.master_swarm_id = Some(first.master_swarm_id.clone());
        }
        if let Some(master_swarm_id) = &self.master_swarm_id {
            self.swarm.set_swarm(stream_swarm_id, master_swarm_id);
        }

        tracing::debug!(segments = queue.len(), stream_swarm_id, "Loading segment queue");

        let retained: HashSet<SegmentId> = queue.iter().map(|segment| segment.id.clone()).collect();
        let previous = std::mem::replace(&mut self.queue, queue);

        let mut update = false;
        for segment in previous {
            if retained.contains(&segment.id) {
                continue;
            }

            if self.http.is_downloading(&segment.id) {
                update = true;
                self.http.abort(&segment.id);
            } else {
                self.swarm.abort(&segment.id);
            }
            tracing::debug!(segment_id = %segment.id, "Segment left the queue");
            self.notify(LoaderNotification::SegmentAbort { segment });
        }

        if self.process_queue().await? {
            update = true;
        }
        if self.clean_storage().await? {
            update = true;
        }

        if update {
            self.publish().await?;
        }
        Ok(())
    }

    /// Returns a cached segment of the current master swarm.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Storage` - If the segment cache fails
    pub async fn segment(&self, segment_id: &SegmentId) -> crate::Result<Option<Segment>> {
        let Some(master_swarm_id) = &self.master_swarm_id else {
            return Ok(None);
        };
        Ok(self.storage.segment(segment_id, master_swarm_id).await?)
    }

    /// Walks the queue once and starts every download the policy allows.
    ///
    /// `stored` holds the cached segments of the current master swarm.
    /// Returns whether any download was started.
    pub fn reconcile(&mut self, stored: &HashMap<SegmentId, Segment>) -> bool {
        let now = self.clock.now();
        let http_allowed = self.is_http_allowed(now, stored);
        let required_priority = self.config.scheduling.required_segments_priority;
        let http_cap = self.config.http.simultaneous_downloads;
        let p2p_cap = self.config.p2p.simultaneous_downloads;
        let overall = self.swarm.overall_availability();

        let mut update = false;
        for index in 0..self.queue.len() {
            let segment = self.queue[index].clone();
            if stored.contains_key(&segment.id) || self.http.is_downloading(&segment.id) {
                continue;
            }

            let required = segment.priority <= required_priority;

            if required && http_allowed && !self.http.is_failed(&segment.id) {
                if self.http.active_downloads_count() >= http_cap {
                    self.preempt_http_after(index);
                }

                if self.http.active_downloads_count() < http_cap {
                    // The peer transfer is only cancelled once HTTP has taken over
                    let resume = self.swarm.partial_data(&segment.id);
                    tracing::debug!(segment_id = %segment.id, priority = segment.priority, "HTTP download (required)");
                    if self.http.download(&segment, resume) {
                        self.swarm.abort(&segment.id);
                        update = true;
                        continue;
                    }
                }
            }

            if self.swarm.is_downloading(&segment.id) {
                continue;
            }

            if required {
                if !overall.is_loaded(&segment.id) {
                    continue;
                }

                if self.swarm.active_downloads_count() >= p2p_cap {
                    self.preempt_p2p_after(index);
                }

                if self.swarm.active_downloads_count() < p2p_cap
                    && self.swarm.download(&segment, self.random.as_mut())
                {
                    tracing::debug!(segment_id = %segment.id, priority = segment.priority, "P2P download (required)");
                    update = true;
                }
                continue;
            }

            if self.swarm.active_downloads_count() < p2p_cap
                && segment.priority <= self.config.p2p.download_max_priority
                && self.swarm.download(&segment, self.random.as_mut())
            {
                tracing::debug!(segment_id = %segment.id, priority = segment.priority, "P2P download");
                update = true;
            }
        }

        update
    }

    /// Opportunistic HTTP sampling tick.
    ///
    /// Starts at most one HTTP download, with probability growing with the
    /// number of eligible segments.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Storage` - If the segment cache fails
    pub async fn sample_http(&mut self) -> crate::Result<()> {
        if self.master_swarm_id.is_none()
            || self.config.p2p.consume_only
            || self.is_initial_phase_active()
            || self.http.active_downloads_count() >= self.config.http.simultaneous_downloads
            || (self.config.http.probability_skip_if_no_peers && self.swarm.peer_count() == 0)
        {
            return Ok(());
        }

        let stored = self.stored_segments().await?;
        let overall = self.swarm.overall_availability();
        let http_max_priority = self.config.http.download_max_priority;

        let candidates: Vec<&Segment> = self
            .queue
            .iter()
            .filter(|segment| {
                !self.http.is_downloading(&segment.id)
                    && !self.swarm.is_downloading(&segment.id)
                    && !overall.contains(&segment.id)
                    && !self.http.is_failed(&segment.id)
                    && segment.priority <= http_max_priority
                    && !stored.contains_key(&segment.id)
            })
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let draw = self.random.next_unit();
        let threshold = self.config.http.download_probability * candidates.len() as f64;
        if draw >= threshold {
            return Ok(());
        }

        let segment = candidates[self.random.next_index(candidates.len())].clone();
        tracing::debug!(segment_id = %segment.id, draw, threshold, "HTTP download (random)");
        self.http.download(&segment, None);
        self.publish().await
    }

    /// Applies one HTTP transport event.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Storage` - If the segment cache fails
    pub async fn handle_http_event(&mut self, event: HttpEvent) -> crate::Result<()> {
        for notice in self.http.handle_event(event) {
            match notice {
                HttpNotice::BytesDownloaded { bytes } => {
                    self.bandwidth.add_bytes(bytes as u64, self.clock.now());
                }
                HttpNotice::SegmentLoaded { segment, data } => {
                    self.on_segment_loaded(segment, data, None).await?;
                }
                HttpNotice::SegmentFailed { segment, error } => {
                    self.on_segment_error(segment, error, None).await?;
                }
            }
        }
        Ok(())
    }

    /// Applies one swarm transport event.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Storage` - If the segment cache fails
    pub async fn handle_swarm_event(&mut self, event: SwarmEvent) -> crate::Result<()> {
        let notices = self.swarm.handle_event(event).await;
        self.apply_swarm_notices(notices).await
    }

    /// Earliest instant `poll_timers` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let initial_check = match self.initial_phase {
            InitialPhase::Active { next_check, .. } => Some(next_check),
            _ => None,
        };

        [self.swarm.next_deadline(), self.sampler_next, initial_check]
            .into_iter()
            .flatten()
            .min()
    }

    /// Runs every timer due at `now`.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Storage` - If the segment cache fails
    pub async fn poll_timers(&mut self, now: Instant) -> crate::Result<()> {
        if self.destroyed {
            return Ok(());
        }

        self.http.purge_failed(now);

        let expired = self.swarm.poll_timeouts(now);
        if !expired.is_empty() {
            self.apply_swarm_notices(expired).await?;
        }

        if let InitialPhase::Active { next_check, .. } = self.initial_phase {
            if next_check <= now {
                self.check_initial_phase(now).await?;
            }
        }

        if self.sampler_next.is_some_and(|next| next <= now) {
            self.sampler_next = Some(now + self.config.http.download_probability_interval);
            self.sample_http().await?;
        }

        Ok(())
    }

    /// Cancels timers and transfers, leaves the swarm and empties the cache.
    ///
    /// Calling it again has no effect.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Storage` - If the segment cache fails to clear
    pub async fn destroy(&mut self) -> crate::Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        tracing::info!(peer_id = %self.swarm.peer_id(), "Destroying loader");
        self.sampler_next = None;
        self.initial_phase = InitialPhase::Finished;
        self.http.destroy();
        self.swarm.destroy();
        self.queue.clear();
        self.master_swarm_id = None;
        self.storage.destroy().await?;
        Ok(())
    }

    /// Builds the availability map advertised to peers: cached segments as
    /// `Loaded`, HTTP downloads in progress as `LoadingByHttp`.
    pub fn create_segments_map(&self, stored: &HashMap<SegmentId, Segment>) -> SegmentsMapPayload {
        let mut map = SegmentsMapPayload::new();

        let mut loaded: Vec<&Segment> = stored.values().collect();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));
        for segment in loaded {
            map.push(&segment.stream_swarm_id(), &segment.sequence, SegmentStatus::Loaded);
        }

        let mut loading: Vec<&Segment> = self.http.active_segments().collect();
        loading.sort_by(|a, b| a.id.cmp(&b.id));
        for segment in loading {
            map.push(
                &segment.stream_swarm_id(),
                &segment.sequence,
                SegmentStatus::LoadingByHttp,
            );
        }

        map
    }

    fn start_timers(&mut self, now: Instant) {
        if self.timers_started {
            return;
        }
        self.timers_started = true;

        self.sampler_next = Some(now + self.config.http.download_probability_interval);

        if self.initial_phase == InitialPhase::Pending && self.config.http.initial_phase_enabled() {
            tracing::debug!(
                timeout = ?self.config.http.initial_timeout,
                per_segment = ?self.config.http.initial_timeout_per_segment,
                "Starting initial P2P phase"
            );
            self.initial_phase = InitialPhase::Active {
                started_at: now,
                next_check: now + self.config.http.initial_timeout_per_segment + INITIAL_CHECK_SLACK,
            };
        }
    }

    async fn check_initial_phase(&mut self, now: Instant) -> crate::Result<()> {
        if self.process_queue().await? {
            self.publish().await?;
        }

        if let InitialPhase::Active { started_at, .. } = self.initial_phase {
            self.initial_phase = InitialPhase::Active {
                started_at,
                next_check: now + self.config.http.initial_timeout_per_segment,
            };
        }
        Ok(())
    }

    /// Whether HTTP may be used for required segments. Ends the startup
    /// phase for good once it allows HTTP.
    fn is_http_allowed(&mut self, now: Instant, stored: &HashMap<SegmentId, Segment>) -> bool {
        let InitialPhase::Active { started_at, .. } = self.initial_phase else {
            return true;
        };

        let elapsed = now.saturating_duration_since(started_at);
        let first_missing_priority = self
            .queue
            .iter()
            .find(|segment| !stored.contains_key(&segment.id))
            .map(|segment| segment.priority);

        let allowed = elapsed >= self.config.http.initial_timeout
            || first_missing_priority.is_some_and(|priority| {
                elapsed > self.config.http.initial_timeout_per_segment && priority <= 0
            });

        if allowed {
            tracing::debug!(?elapsed, "Initial P2P phase ended");
            self.initial_phase = InitialPhase::Finished;
        }
        allowed
    }

    /// Aborts the HTTP download furthest down the queue, after `index`.
    fn preempt_http_after(&mut self, index: usize) {
        let Some(victim) = self.queue[index + 1..]
            .iter()
            .rev()
            .find(|segment| self.http.is_downloading(&segment.id))
            .map(|segment| segment.id.clone())
        else {
            return;
        };

        tracing::debug!(segment_id = %victim, for_segment = %self.queue[index].id, "Preempting HTTP download");
        self.http.abort(&victim);
    }

    /// Aborts the P2P download furthest down the queue, after `index`.
    fn preempt_p2p_after(&mut self, index: usize) {
        let Some(victim) = self.queue[index + 1..]
            .iter()
            .rev()
            .find(|segment| self.swarm.is_downloading(&segment.id))
            .map(|segment| segment.id.clone())
        else {
            return;
        };

        tracing::debug!(segment_id = %victim, for_segment = %self.queue[index].id, "Preempting P2P download");
        self.swarm.abort(&victim);
    }

    async fn apply_swarm_notices(&mut self, notices: Vec<SwarmNotice>) -> crate::Result<()> {
        for notice in notices {
            match notice {
                SwarmNotice::PeerConnected {
                    peer_id,
                    remote_address,
                } => {
                    self.notify(LoaderNotification::PeerConnect {
                        peer_id,
                        remote_address,
                    });
                    if !self.config.p2p.consume_only {
                        let stored = self.stored_segments().await?;
                        let map = self.create_segments_map(&stored);
                        self.swarm.send_segments_map(&peer_id, &map);
                    }
                }
                SwarmNotice::PeerClosed { peer_id } => {
                    self.notify(LoaderNotification::PeerClose { peer_id });
                }
                SwarmNotice::AvailabilityChanged => {
                    if self.process_queue().await? {
                        self.publish().await?;
                    }
                }
                SwarmNotice::SegmentLoaded {
                    segment,
                    data,
                    peer_id,
                } => self.on_segment_loaded(segment, data, Some(peer_id)).await?,
                SwarmNotice::SegmentFailed {
                    segment,
                    error,
                    peer_id,
                } => self.on_segment_error(segment, error, Some(peer_id)).await?,
                SwarmNotice::BytesDownloaded { bytes, .. } => {
                    self.bandwidth.add_bytes(bytes as u64, self.clock.now());
                }
                SwarmNotice::BytesUploaded { bytes, peer_id } => {
                    self.notify(LoaderNotification::BytesUploaded {
                        method: DownloadMethod::P2p,
                        bytes,
                        peer_id,
                    });
                }
                SwarmNotice::TrackerUpdate { incomplete } => {
                    self.on_tracker_update(incomplete).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_segment_loaded(
        &mut self,
        mut segment: Segment,
        data: Bytes,
        peer_id: Option<PeerId>,
    ) -> crate::Result<()> {
        segment.data = Some(data);
        segment.download_bandwidth = Some(self.bandwidth.bandwidth(self.clock.now()));

        tracing::debug!(
            segment_id = %segment.id,
            bytes = segment.data_len(),
            peer_id = ?peer_id,
            "Segment loaded"
        );
        self.storage.store_segment(segment.clone()).await?;
        self.notify(LoaderNotification::SegmentLoaded { segment, peer_id });

        self.process_queue().await?;
        self.publish().await
    }

    async fn on_segment_error(
        &mut self,
        segment: Segment,
        error: SegmentError,
        peer_id: Option<PeerId>,
    ) -> crate::Result<()> {
        tracing::debug!(segment_id = %segment.id, %error, peer_id = ?peer_id, "Segment download failed");
        self.notify(LoaderNotification::SegmentError {
            segment,
            error,
            peer_id,
        });

        if self.process_queue().await? {
            self.publish().await?;
        }
        Ok(())
    }

    async fn on_tracker_update(&mut self, incomplete: Option<u32>) -> crate::Result<()> {
        let phase_open = matches!(
            self.initial_phase,
            InitialPhase::Pending | InitialPhase::Active { .. }
        );
        if !phase_open || !incomplete.is_some_and(|count| count <= 1) {
            return Ok(());
        }

        tracing::debug!(?incomplete, "No peers to fetch from, ending initial P2P phase");
        self.initial_phase = InitialPhase::Finished;
        if self.process_queue().await? {
            self.publish().await?;
        }
        Ok(())
    }

    async fn stored_segments(&self) -> crate::Result<HashMap<SegmentId, Segment>> {
        match &self.master_swarm_id {
            Some(master_swarm_id) => Ok(self.storage.segments_map(master_swarm_id).await?),
            None => Ok(HashMap::new()),
        }
    }

    async fn process_queue(&mut self) -> crate::Result<bool> {
        if self.master_swarm_id.is_none() {
            return Ok(false);
        }
        let stored = self.stored_segments().await?;
        Ok(self.reconcile(&stored))
    }

    /// Evicts cache entries; segments still queued are kept.
    async fn clean_storage(&self) -> crate::Result<bool> {
        let Some(master_swarm_id) = &self.master_swarm_id else {
            return Ok(false);
        };

        let queued: HashSet<SegmentId> = self.queue.iter().map(|segment| segment.id.clone()).collect();
        let locked = move |segment_id: &SegmentId| queued.contains(segment_id);
        Ok(self.storage.clean(master_swarm_id, &locked).await?)
    }

    /// Sends the local availability map to every peer.
    async fn publish(&self) -> crate::Result<()> {
        if self.config.p2p.consume_only || self.master_swarm_id.is_none() {
            return Ok(());
        }

        let stored = self.stored_segments().await?;
        let map = self.create_segments_map(&stored);
        self.swarm.send_segments_map_to_all(&map);
        Ok(())
    }

    fn notify(&self, notification: LoaderNotification) {
        tracing::trace!(event = notification.name(), "Loader notification");
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }
}

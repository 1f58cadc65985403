//! Loader engine: builds a scheduler from its collaborators and runs it as
//! an actor behind a cloneable handle.

pub mod actor;
pub mod commands;
pub mod handle;

use std::sync::Arc;

pub use commands::{LoaderCommand, LoaderStats};
pub use handle::LoaderHandle;
use tokio::sync::mpsc;

use crate::clock::{SharedClock, SystemClock};
use crate::config::LoaderConfig;
use crate::http::{HttpDownloader, HttpEvent, HttpTransport};
use crate::random::{RandomSource, seeded_source};
use crate::scheduler::Scheduler;
use crate::storage::{MemorySegmentsStorage, SegmentsStorage};
use crate::swarm::{PeerId, SwarmCoordinator, SwarmEvent, SwarmTransport};
use crate::validation::{SegmentUrlBuilder, SegmentValidator};

/// Buffer size of the command channel.
const COMMAND_BUFFER: usize = 100;

/// Assembles a loader from configuration and pluggable collaborators.
///
/// Storage defaults to `MemorySegmentsStorage`, the clock to `SystemClock`,
/// and randomness to a ChaCha generator seeded from
/// `scheduling.deterministic_seed`.
pub struct LoaderBuilder {
    config: LoaderConfig,
    storage: Option<Arc<dyn SegmentsStorage>>,
    validator: Option<Arc<dyn SegmentValidator>>,
    url_builder: Option<Arc<dyn SegmentUrlBuilder>>,
    clock: Option<SharedClock>,
    random: Option<Box<dyn RandomSource>>,
}

impl LoaderBuilder {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            storage: None,
            validator: None,
            url_builder: None,
            clock: None,
            random: None,
        }
    }

    pub fn storage(mut self, storage: Arc<dyn SegmentsStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn SegmentValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn url_builder(mut self, url_builder: Arc<dyn SegmentUrlBuilder>) -> Self {
        self.url_builder = Some(url_builder);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn random(mut self, random: Box<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    /// Builds a scheduler for direct, synchronous driving.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Configuration` - If the configuration is invalid
    pub fn build_scheduler(
        self,
        http: Arc<dyn HttpTransport>,
        swarm: Arc<dyn SwarmTransport>,
    ) -> crate::Result<Scheduler> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let mut random = self
            .random
            .unwrap_or_else(|| seeded_source(self.config.scheduling.deterministic_seed));
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(MemorySegmentsStorage::new(
                self.config.cache.clone(),
                Arc::clone(&clock),
            ))
        });

        let peer_id = PeerId::generate(random.as_mut());
        tracing::info!(%peer_id, p2p = self.config.p2p.enabled, "Building loader");

        let downloader = HttpDownloader::new(
            self.config.http.clone(),
            http,
            self.url_builder,
            self.validator.clone(),
            Arc::clone(&clock),
        );
        let coordinator = SwarmCoordinator::new(
            &self.config,
            peer_id,
            swarm,
            Arc::clone(&storage),
            self.validator,
            Arc::clone(&clock),
        );

        Ok(Scheduler::new(
            self.config,
            clock,
            random,
            storage,
            downloader,
            coordinator,
        ))
    }

    /// Spawns the loader actor on the current tokio runtime.
    ///
    /// `http_events` and `swarm_events` are the channels the transports
    /// report on.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Configuration` - If the configuration is invalid
    pub fn spawn(
        self,
        http: Arc<dyn HttpTransport>,
        http_events: mpsc::UnboundedReceiver<HttpEvent>,
        swarm: Arc<dyn SwarmTransport>,
        swarm_events: mpsc::UnboundedReceiver<SwarmEvent>,
    ) -> crate::Result<LoaderHandle> {
        let scheduler = self.build_scheduler(http, swarm)?;
        let notifications = scheduler.notification_sender();
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);

        tokio::spawn(actor::run_actor_loop(
            scheduler,
            receiver,
            http_events,
            swarm_events,
        ));

        Ok(LoaderHandle::new(sender, notifications))
    }
}

//! Centralized configuration for the Meshcast loader.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::LoaderError;

/// Central configuration for all loader components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    pub cache: CacheConfig,
    pub http: HttpConfig,
    pub p2p: P2pConfig,
    pub tracker: TrackerConfig,
    pub scheduling: SchedulingConfig,
}

/// In-memory segment cache limits.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entries idle for longer than this are evicted on the next clean
    pub cached_segment_expiration: Duration,
    /// Maximum number of entries kept after a clean
    pub cached_segments_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cached_segment_expiration: Duration::from_secs(5 * 60),
            cached_segments_count: 30,
        }
    }
}

/// Origin (HTTP) download behavior.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Maximum concurrent HTTP downloads
    pub simultaneous_downloads: usize,
    /// Per-candidate probability of an opportunistic HTTP download per tick
    pub download_probability: f64,
    /// Interval between opportunistic HTTP sampling ticks
    pub download_probability_interval: Duration,
    /// Skip opportunistic sampling while no peer is connected
    pub probability_skip_if_no_peers: bool,
    /// Cooldown before a failed segment may be retried over HTTP
    pub failed_segment_timeout: Duration,
    /// Segments with a higher priority value are never fetched over HTTP
    pub download_max_priority: i32,
    /// Length of the startup phase that prefers P2P (zero disables it)
    pub initial_timeout: Duration,
    /// Per-segment deadline that ends the startup phase early
    pub initial_timeout_per_segment: Duration,
    /// Resume aborted P2P transfers over HTTP with range requests
    pub use_ranges: bool,
    /// Transport-level timeout for a single HTTP request
    pub request_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            simultaneous_downloads: 2,
            download_probability: 0.1,
            download_probability_interval: Duration::from_secs(1),
            probability_skip_if_no_peers: false,
            failed_segment_timeout: Duration::from_secs(10),
            download_max_priority: 20,
            initial_timeout: Duration::ZERO,
            initial_timeout_per_segment: Duration::from_secs(4),
            use_ranges: false,
            request_timeout: Duration::from_secs(30),
            user_agent: "meshcast/0.1.0",
        }
    }
}

impl HttpConfig {
    /// Whether the P2P-first startup phase is configured.
    pub fn initial_phase_enabled(&self) -> bool {
        !self.initial_timeout.is_zero() && !self.initial_timeout_per_segment.is_zero()
    }
}

/// Peer-to-peer download behavior.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Join swarms and exchange segments with peers
    pub enabled: bool,
    /// Download from peers but never advertise availability
    pub consume_only: bool,
    /// Maximum concurrent P2P downloads
    pub simultaneous_downloads: usize,
    /// Segments with a higher priority value are never fetched from peers
    pub download_max_priority: i32,
    /// Deadline for a peer to start answering a segment request
    pub segment_download_timeout: Duration,
    /// Largest payload chunk written to a peer channel
    pub max_message_size: usize,
    /// ICE servers handed to the peer transport
    pub ice_servers: Vec<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consume_only: false,
            simultaneous_downloads: 3,
            download_max_priority: 20,
            segment_download_timeout: Duration::from_secs(60),
            max_message_size: 64 * 1024 - 1,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:global.stun.twilio.com:3478".to_string(),
            ],
        }
    }
}

/// Tracker announce configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Tracker endpoints announced to for every swarm
    pub announce_urls: Vec<String>,
    /// Peers requested from each tracker per announce
    pub peer_requests_per_announce: usize,
    /// Keep the tracker connection open when only the swarm changes
    pub reuse_connection_on_swarm_change: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            announce_urls: vec![
                "wss://tracker.novage.com.ua".to_string(),
                "wss://tracker.openwebtorrent.com".to_string(),
            ],
            peer_requests_per_announce: 10,
            reuse_connection_on_swarm_change: true,
        }
    }
}

/// Queue scheduling policy.
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    /// Segments at or under this priority are fetched as fast as possible
    pub required_segments_priority: i32,
    /// Deterministic seed for reproducible random decisions
    pub deterministic_seed: Option<u64>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            required_segments_priority: 1,
            deterministic_seed: None,
        }
    }
}

impl LoaderConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(trackers) = std::env::var("MESHCAST_TRACKERS") {
            config.tracker.announce_urls = trackers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(enabled) = std::env::var("MESHCAST_USE_P2P") {
            config.p2p.enabled = enabled.parse().unwrap_or(true);
        }

        if let Ok(consume_only) = std::env::var("MESHCAST_CONSUME_ONLY") {
            config.p2p.consume_only = consume_only.parse().unwrap_or(false);
        }

        if let Ok(count) = std::env::var("MESHCAST_SIMULTANEOUS_HTTP") {
            if let Ok(count) = count.parse::<usize>() {
                config.http.simultaneous_downloads = count;
            }
        }

        if let Ok(count) = std::env::var("MESHCAST_SIMULTANEOUS_P2P") {
            if let Ok(count) = count.parse::<usize>() {
                config.p2p.simultaneous_downloads = count;
            }
        }

        if let Ok(seed) = std::env::var("MESHCAST_SEED") {
            if let Ok(seed) = seed.parse::<u64>() {
                config.scheduling.deterministic_seed = Some(seed);
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            tracker: TrackerConfig {
                announce_urls: Vec::new(),
                ..TrackerConfig::default()
            },
            scheduling: SchedulingConfig {
                deterministic_seed: Some(42),
                ..SchedulingConfig::default()
            },
            ..Default::default()
        }
    }

    /// Checks that the configuration can drive a loader.
    ///
    /// # Errors
    ///
    /// - `LoaderError::Configuration` - If a value is outside its valid range
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.p2p.max_message_size == 0 {
            return Err(LoaderError::Configuration {
                reason: "p2p.max_message_size must be greater than zero".to_string(),
            });
        }

        let probability = self.http.download_probability;
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(LoaderError::Configuration {
                reason: format!("http.download_probability {probability} is outside [0, 1]"),
            });
        }

        if self.http.download_probability_interval.is_zero() {
            return Err(LoaderError::Configuration {
                reason: "http.download_probability_interval must be non-zero".to_string(),
            });
        }

        for announce_url in &self.tracker.announce_urls {
            url::Url::parse(announce_url).map_err(|e| LoaderError::Configuration {
                reason: format!("invalid tracker url {announce_url}: {e}"),
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = LoaderConfig::default();

        assert_eq!(config.cache.cached_segment_expiration, Duration::from_secs(300));
        assert_eq!(config.cache.cached_segments_count, 30);
        assert_eq!(config.http.simultaneous_downloads, 2);
        assert_eq!(config.http.failed_segment_timeout, Duration::from_secs(10));
        assert_eq!(config.p2p.simultaneous_downloads, 3);
        assert_eq!(config.p2p.max_message_size, 65535);
        assert_eq!(config.tracker.peer_requests_per_announce, 10);
        assert_eq!(config.scheduling.required_segments_priority, 1);
        assert!(!config.http.initial_phase_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_preset() {
        let config = LoaderConfig::for_testing();
        assert!(config.tracker.announce_urls.is_empty());
        assert_eq!(config.scheduling.deterministic_seed, Some(42));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = LoaderConfig::default();
        config.p2p.max_message_size = 0;
        assert!(config.validate().unwrap_err().is_user_error());

        let mut config = LoaderConfig::default();
        config.http.download_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = LoaderConfig::default();
        config.http.download_probability = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = LoaderConfig::default();
        config.tracker.announce_urls = vec!["not a url".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("MESHCAST_TRACKERS", "wss://a.example, wss://b.example");
            std::env::set_var("MESHCAST_CONSUME_ONLY", "true");
            std::env::set_var("MESHCAST_SIMULTANEOUS_HTTP", "4");
            std::env::set_var("MESHCAST_SEED", "12345");
        }

        let config = LoaderConfig::from_env();

        assert_eq!(
            config.tracker.announce_urls,
            vec!["wss://a.example".to_string(), "wss://b.example".to_string()]
        );
        assert!(config.p2p.consume_only);
        assert_eq!(config.http.simultaneous_downloads, 4);
        assert_eq!(config.scheduling.deterministic_seed, Some(12345));

        // Cleanup
        unsafe {
            std::env::remove_var("MESHCAST_TRACKERS");
            std::env::remove_var("MESHCAST_CONSUME_ONLY");
            std::env::remove_var("MESHCAST_SIMULTANEOUS_HTTP");
            std::env::remove_var("MESHCAST_SEED");
        }
    }
}

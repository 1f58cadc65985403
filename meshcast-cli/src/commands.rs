//! CLI command implementations

use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use meshcast_core::LoaderConfig;
use meshcast_sim::{NetworkConfig, OriginConfig, ScenarioConfig, ViewerReport, run_scenario};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Play a swarm of simulated viewers through one stream
    Simulate {
        /// Number of viewers
        #[arg(short, long, default_value = "4")]
        viewers: usize,
        /// Segments in the playlist
        #[arg(short, long, default_value = "30")]
        segments: usize,
        /// Body size of every segment in bytes
        #[arg(long, default_value = "262144")]
        segment_size: usize,
        /// Segments queued ahead of the playhead
        #[arg(short, long, default_value = "8")]
        window: usize,
        /// Seed for playlist bodies and loader randomness
        #[arg(long, default_value = "1")]
        seed: u64,
        /// Playback time of one segment in milliseconds
        #[arg(long, default_value = "250")]
        segment_ms: u64,
        /// Delay between viewers joining in milliseconds
        #[arg(long, default_value = "1000")]
        stagger_ms: u64,
        /// Origin latency in milliseconds
        #[arg(long, default_value = "40")]
        origin_latency_ms: u64,
        /// Offer every peer pairing twice
        #[arg(long)]
        duplicate_candidates: bool,
        /// Disable peer-to-peer delivery
        #[arg(long)]
        no_p2p: bool,
    },
    /// Print the effective loader configuration
    Config,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate {
            viewers,
            segments,
            segment_size,
            window,
            seed,
            segment_ms,
            stagger_ms,
            origin_latency_ms,
            duplicate_candidates,
            no_p2p,
        } => {
            let scenario = ScenarioConfig {
                viewers,
                segments,
                segment_size,
                window,
                seed,
                segment_duration: Duration::from_millis(segment_ms),
                stagger: Duration::from_millis(stagger_ms),
                origin: OriginConfig {
                    latency: Duration::from_millis(origin_latency_ms),
                    ..OriginConfig::default()
                },
                network: NetworkConfig {
                    duplicate_candidates,
                },
                ..ScenarioConfig::default()
            };
            simulate(&scenario, !no_p2p).await
        }
        Commands::Config => show_config(),
    }
}

/// Run a simulation and print the HTTP/P2P split per viewer
///
/// # Errors
/// - Invalid loader configuration
/// - A viewer engine failing during playback
pub async fn simulate(scenario: &ScenarioConfig, p2p: bool) -> anyhow::Result<()> {
    let mut loader = LoaderConfig::from_env();
    loader.tracker.announce_urls.clear();
    loader.p2p.enabled = p2p;
    loader
        .validate()
        .context("Invalid loader configuration")?;

    println!(
        "Simulating {} viewers over {} segments of {} bytes",
        scenario.viewers, scenario.segments, scenario.segment_size
    );

    let reports = run_scenario(scenario, &loader)
        .await
        .context("Simulation failed")?;

    print_reports(&reports);
    Ok(())
}

fn print_reports(reports: &[ViewerReport]) {
    println!(
        "{:<7} {:<18} {:>10} {:>10} {:>10} {:>6} {:>7} {:>6}",
        "viewer", "peer", "http KiB", "p2p KiB", "up KiB", "p2p %", "stalls", "peers"
    );

    let mut http = 0;
    let mut p2p = 0;
    for report in reports {
        let peer = report
            .peer_id
            .map(|peer_id| peer_id.to_string()[16..32].to_string())
            .unwrap_or_default();
        println!(
            "{:<7} {:<18} {:>10} {:>10} {:>10} {:>6.1} {:>7} {:>6}",
            report.viewer,
            peer,
            report.http_bytes / 1024,
            report.p2p_bytes / 1024,
            report.uploaded_bytes / 1024,
            report.p2p_ratio() * 100.0,
            report.stalls,
            report.peers_connected,
        );
        http += report.http_bytes;
        p2p += report.p2p_bytes;
    }

    let total = http + p2p;
    let share = if total == 0 {
        0.0
    } else {
        p2p as f64 * 100.0 / total as f64
    };
    println!(
        "total: {} KiB from origin, {} KiB from peers ({share:.1}% offloaded)",
        http / 1024,
        p2p / 1024
    );
}

/// Print the configuration built from defaults and `MESHCAST_*` overrides
///
/// # Errors
/// - The configuration fails validation
pub fn show_config() -> anyhow::Result<()> {
    let config = LoaderConfig::from_env();
    println!("{config:#?}");
    config.validate().context("Configuration is invalid")?;
    Ok(())
}

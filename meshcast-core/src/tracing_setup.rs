//! Log output for the `meshcast` binary.
//!
//! The console shows the level picked on the command line. The per-run file
//! keeps every loader decision, so a stalled playback can be replayed from
//! the scheduler's point of view.

use std::fs::{File, create_dir_all};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Overrides the console level with a full filter, e.g. `meshcast_core::swarm=trace`.
pub const LOG_ENV: &str = "MESHCAST_LOG";

const LAST_RUN_LOG: &str = "meshcast-last-run.log";

/// Loader crates at trace, HTTP client internals kept at info.
const FILE_FILTER: &str = "info,meshcast=trace,meshcast_core=trace,meshcast_sim=trace";

/// Installs the console and file subscribers.
///
/// The file is `<logs_dir>/meshcast-last-run.log`, `./logs` by default, and
/// is truncated on every start.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the log file cannot be created or a subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let logs_dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_dir)?;
    let log_file_path = logs_dir.join(LAST_RUN_LOG);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(log_file)
        .with_filter(EnvFilter::try_new(FILE_FILTER)?);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(console = %console_level, file = %log_file_path.display(), "Logging started");
    Ok(())
}

/// `--log-level` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    /// Scheduling decisions
    Debug,
    /// Per-frame peer traffic
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

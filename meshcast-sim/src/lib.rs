//! Meshcast Simulation - In-process collaborators for the loader engine.
//!
//! Lets many engines run against each other inside one process without
//! sockets: a simulated HTTP origin, a simulated peer network with tracker
//! rooms, a synthetic playlist, and a scenario runner that plays viewers
//! through it.
//!
//! # Example
//!
//! ```rust,no_run
//! use meshcast_core::LoaderConfig;
//! use meshcast_sim::{ScenarioConfig, run_scenario};
//!
//! # async fn example() -> Result<(), meshcast_sim::SimulationError> {
//! let reports = run_scenario(&ScenarioConfig::default(), &LoaderConfig::for_testing()).await?;
//! for report in reports {
//!     println!("viewer {}: {:.0}% from peers", report.viewer, report.p2p_ratio() * 100.0);
//! }
//! # Ok(())
//! # }
//! ```

pub mod network;
pub mod origin;
pub mod playlist;
pub mod scenario;

pub use network::{NetworkConfig, SimulatedNetwork, SimulatedSwarmTransport};
pub use origin::{OriginConfig, SimulatedOrigin};
pub use playlist::Playlist;
pub use scenario::{ScenarioConfig, SimulationError, ViewerReport, run_scenario};

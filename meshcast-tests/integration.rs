//! Integration tests for Meshcast
//!
//! Real loader engines talk to each other through the simulated origin and
//! peer network from `meshcast-sim`. Every wait is bounded by a timeout.

#[path = "integration/support.rs"]
mod support;

#[path = "integration/http_fallback.rs"]
mod http_fallback;
#[path = "integration/p2p_delivery.rs"]
mod p2p_delivery;
#[path = "integration/playback.rs"]
mod playback;
#[path = "integration/swarm_lifecycle.rs"]
mod swarm_lifecycle;

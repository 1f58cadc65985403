//! Randomness used by scheduling decisions.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Uniform random draws consumed by the scheduler and the swarm coordinator.
pub trait RandomSource: Send + Sync {
    /// Returns a value uniformly distributed in `[0, 1)`.
    fn next_unit(&mut self) -> f64;

    /// Returns an index uniformly distributed in `0..len`.
    ///
    /// `len` must be non-zero.
    fn next_index(&mut self, len: usize) -> usize;
}

impl<R: Rng + Send + Sync> RandomSource for R {
    fn next_unit(&mut self) -> f64 {
        self.random::<f64>()
    }

    fn next_index(&mut self, len: usize) -> usize {
        self.random_range(0..len)
    }
}

/// Creates the default generator, deterministic when a seed is given.
pub fn seeded_source(seed: Option<u64>) -> Box<dyn RandomSource> {
    let seed = seed.unwrap_or_else(rand::random);
    Box::new(ChaCha8Rng::seed_from_u64(seed))
}

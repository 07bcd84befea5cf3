//! Deterministic random streams.
//!
//! A root seed drives a ChaCha8 stream from which one seed per training step
//! is drawn in order. Re-running with the same root seed therefore replays
//! identical per-step streams, and a retried step can rebuild its generator
//! from the same seed.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Sequential per-step seed source.
#[derive(Clone, Debug)]
pub struct RngSequence {
    parent: ChaCha8Rng,
}

impl RngSequence {
    pub fn new(seed: u64) -> Self {
        Self {
            parent: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn next_seed(&mut self) -> u64 {
        self.parent.next_u64()
    }
}

impl Iterator for RngSequence {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        Some(self.next_seed())
    }
}

/// Derive two independent seeds from one.
pub fn split_seed(seed: u64) -> (u64, u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (rng.next_u64(), rng.next_u64())
}

pub fn step_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

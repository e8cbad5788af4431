// src/policy.rs
//
// Seeded uniform-random policy for smoke runs and harness shakedowns.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::EnvMode;
use crate::env::Action;

/// Samples every action component uniformly from [0, 1].
#[derive(Debug, Clone)]
pub struct UniformPolicy {
    rng: ChaCha8Rng,
    seed: u64,
}

impl UniformPolicy {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn reseed(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    fn vector(&mut self, dim: usize) -> Vec<f64> {
        (0..dim).map(|_| self.rng.gen_range(0.0..=1.0)).collect()
    }

    /// Action shaped like `dims` (one entry per agent).
    ///
    /// Single-agent mode yields a flat action from the first entry.
    pub fn sample(&mut self, mode: EnvMode, dims: &[usize]) -> Action {
        match mode {
            EnvMode::Single => Action::Flat(self.vector(dims.first().copied().unwrap_or(0))),
            EnvMode::Multi => Action::Groups(dims.iter().map(|&d| self.vector(d)).collect()),
        }
    }
}

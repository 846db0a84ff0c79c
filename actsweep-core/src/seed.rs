//! Seed management for reproducible, resumable runs.
//!
//! Every random draw in a run comes from an explicit [`SessionRng`] built
//! from the base seed. Per-epoch generators are a pure function of
//! `(base seed, epoch)`, so epoch N sees the same data order whether it runs
//! in a fresh process or after a resume.

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The generator threaded through every stochastic call.
pub type SessionRng = StdRng;

/// Derives independent generators from one base seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedManager {
    pub base_seed: u64,
}

impl SeedManager {
    pub fn new(base_seed: u64) -> Self {
        Self { base_seed }
    }

    /// Seed of a named component stream (`"hyperparams"`, `"init"`, `"data"`).
    pub fn component_seed(&self, component: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.base_seed.to_le_bytes());
        hasher.update(b"/");
        hasher.update(component.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Generator for a named component stream.
    pub fn component_rng(&self, component: &str) -> SessionRng {
        SessionRng::seed_from_u64(self.component_seed(component))
    }

    /// Seed of epoch `epoch` in a run with `epoch_budget` epochs.
    pub fn epoch_seed(&self, epoch_budget: u32, epoch: u32) -> u64 {
        self.base_seed
            .wrapping_mul(u64::from(epoch_budget))
            .wrapping_add(u64::from(epoch))
    }

    /// Generator used for everything stochastic inside one epoch.
    pub fn epoch_rng(&self, epoch_budget: u32, epoch: u32) -> SessionRng {
        SessionRng::seed_from_u64(self.epoch_seed(epoch_budget, epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_epoch_rng_is_pure() {
        let seeds = SeedManager::new(7);
        let mut first = seeds.epoch_rng(10, 3);
        let mut second = seeds.epoch_rng(10, 3);
        let x: Vec<u64> = (0..8).map(|_| first.gen_range(0..u64::MAX)).collect();
        let y: Vec<u64> = (0..8).map(|_| second.gen_range(0..u64::MAX)).collect();
        assert_eq!(x, y);
    }

    #[test]
    fn test_epoch_seeds_differ_per_epoch() {
        let seeds = SeedManager::new(3);
        assert_eq!(seeds.epoch_seed(10, 1), 31);
        assert_ne!(seeds.epoch_seed(10, 1), seeds.epoch_seed(10, 2));
    }

    #[test]
    fn test_component_streams_are_independent() {
        let seeds = SeedManager::new(42);
        assert_ne!(
            seeds.component_seed("hyperparams"),
            seeds.component_seed("init")
        );
        assert_eq!(
            seeds.component_seed("init"),
            SeedManager::new(42).component_seed("init")
        );
    }
}

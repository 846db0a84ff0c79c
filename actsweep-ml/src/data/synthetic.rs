//! Seeded Gaussian blobs for smoke runs and tests.

use super::RawDataset;
use actsweep_core::{DatasetKind, SessionRng};
use rand::{Rng, SeedableRng};

/// Training examples generated when no sample size is configured.
pub const DEFAULT_TRAIN_EXAMPLES: usize = 2048;

const DATA_SEED: u64 = 0x5EED_B10B;
const CENTER_SCALE: f32 = 1.5;

/// Standard normal draw (Box-Muller).
fn normal(rng: &mut SessionRng) -> f32 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    ((-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()) as f32
}

/// `count` examples, classes assigned round-robin, each a noisy copy of its
/// class centre. The data never depends on the run seed.
pub fn generate(count: usize) -> RawDataset {
    let shape = DatasetKind::Synthetic.shape();
    let width = shape.flat_features();
    let mut rng = SessionRng::seed_from_u64(DATA_SEED);
    let centers: Vec<Vec<f32>> = (0..shape.classes)
        .map(|_| (0..width).map(|_| normal(&mut rng) * CENTER_SCALE).collect())
        .collect();

    let mut pixels = Vec::with_capacity(count * width);
    let mut labels = Vec::with_capacity(count);
    for i in 0..count {
        let class = i % shape.classes;
        labels.push(class as u32);
        pixels.extend(centers[class].iter().map(|c| c + normal(&mut rng)));
    }
    RawDataset {
        shape,
        pixels,
        labels,
    }
}

//! Dart throwing and work division

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Darts this task throws.
///
/// Every task gets `total / size`; the manager also takes the remainder so
/// the shares always add up to `total`.
pub fn work_share(total: u64, size: usize, is_manager: bool) -> u64 {
    let size = size.max(1) as u64;
    let base = total / size;
    if is_manager { base + total % size } else { base }
}

/// Generator for `rank`: offset from `seed` when given, else from entropy.
pub fn rng_for(seed: Option<u64>, rank: usize) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(rank as u64)),
        None => StdRng::from_entropy(),
    }
}

/// Throw `throws` darts at the square [-1, 1]² and count those landing in
/// the unit circle.
pub fn throw_darts<R: Rng>(rng: &mut R, throws: u64) -> u64 {
    let mut hits = 0;
    for _ in 0..throws {
        let x: f64 = rng.gen_range(-1.0..=1.0);
        let y: f64 = rng.gen_range(-1.0..=1.0);
        if x * x + y * y <= 1.0 {
            hits += 1;
        }
    }
    hits
}

/// π from the circle/square hit ratio
pub fn estimate_pi(hits: u64, throws: u64) -> f64 {
    if throws == 0 {
        return f64::NAN;
    }
    4.0 * hits as f64 / throws as f64
}

//! PCF Sample Tables
//!
//! Unit-disk offsets used by the shadow projection filter. Edge samples sit
//! on the rim of the filter disk and decide whether a pixel is fully lit or
//! fully shadowed; refining samples fill the interior for pixels on a
//! penumbra.
//!
//! | Table       | Count | Used by            |
//! |-------------|-------|--------------------|
//! | `EDGE_4`    | 4     | low quality        |
//! | `EDGE_8`    | 8     | medium, high       |
//! | `REFINE_*`  | 4..32 | per quality level  |
//!
//! Counts without a table fall back to [`poisson_disk`].

use std::borrow::Cow;

use glam::Vec2;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

/// Candidates tried per sample before the best one so far is kept.
pub const MAX_REPLACE_TRIES: usize = 10;

/// Seed of the fallback generator; fixed so every run sees the same kernel.
const FALLBACK_SEED: u64 = 0x5eed_0f_d15c;

// ============================================================================
// Static tables
// ============================================================================

/// Edge samples on the rim, rotated 45 degrees off the axes.
pub const EDGE_4: [Vec2; 4] = [
    Vec2::new(0.707107, 0.707107),
    Vec2::new(-0.707107, 0.707107),
    Vec2::new(-0.707107, -0.707107),
    Vec2::new(0.707107, -0.707107),
];

pub const EDGE_8: [Vec2; 8] = [
    Vec2::new(0.923880, 0.382683),
    Vec2::new(0.382683, 0.923880),
    Vec2::new(-0.382683, 0.923880),
    Vec2::new(-0.923880, 0.382683),
    Vec2::new(-0.923880, -0.382683),
    Vec2::new(-0.382683, -0.923880),
    Vec2::new(0.382683, -0.923880),
    Vec2::new(0.923880, -0.382683),
];

pub const REFINE_4: [Vec2; 4] = [
    Vec2::new(0.500000, 0.000000),
    Vec2::new(0.000000, 0.500000),
    Vec2::new(-0.500000, 0.000000),
    Vec2::new(0.000000, -0.500000),
];

pub const REFINE_8: [Vec2; 8] = [
    Vec2::new(0.286601, 0.088656),
    Vec2::new(-0.220079, 0.203876),
    Vec2::new(-0.066522, -0.292532),
    Vec2::new(0.447559, 0.563995),
    Vec2::new(-0.398088, 0.599938),
    Vec2::new(-0.693591, -0.193213),
    Vec2::new(-0.030575, -0.719351),
    Vec2::new(0.674695, -0.251370),
];

pub const REFINE_12: [Vec2; 12] = [
    Vec2::new(0.274419, 0.055627),
    Vec2::new(-0.055627, 0.274419),
    Vec2::new(-0.274419, -0.055627),
    Vec2::new(0.055627, -0.274419),
    Vec2::new(0.577735, 0.395250),
    Vec2::new(0.129037, 0.688004),
    Vec2::new(-0.395250, 0.577735),
    Vec2::new(-0.688004, 0.129037),
    Vec2::new(-0.577735, -0.395250),
    Vec2::new(-0.129037, -0.688004),
    Vec2::new(0.395250, -0.577735),
    Vec2::new(0.688004, -0.129037),
];

pub const REFINE_16: [Vec2; 16] = [
    Vec2::new(0.268651, 0.026955),
    Vec2::new(0.057382, 0.263832),
    Vec2::new(-0.233187, 0.136102),
    Vec2::new(-0.201500, -0.179716),
    Vec2::new(0.108654, -0.247173),
    Vec2::new(0.648322, 0.313175),
    Vec2::new(0.376088, 0.613969),
    Vec2::new(-0.015552, 0.719832),
    Vec2::new(-0.402253, 0.597153),
    Vec2::new(-0.661243, 0.284883),
    Vec2::new(-0.710292, -0.117836),
    Vec2::new(-0.533829, -0.483143),
    Vec2::new(-0.187879, -0.695055),
    Vec2::new(0.217722, -0.686292),
    Vec2::new(0.554197, -0.459637),
    Vec2::new(0.714718, -0.087050),
];

pub const REFINE_24: [Vec2; 24] = [
    Vec2::new(0.250000, 0.000000),
    Vec2::new(0.125000, 0.216506),
    Vec2::new(-0.125000, 0.216506),
    Vec2::new(-0.250000, 0.000000),
    Vec2::new(-0.125000, -0.216506),
    Vec2::new(0.125000, -0.216506),
    Vec2::new(0.506584, 0.214180),
    Vec2::new(0.206760, 0.509657),
    Vec2::new(-0.214180, 0.506584),
    Vec2::new(-0.509657, 0.206760),
    Vec2::new(-0.506584, -0.214180),
    Vec2::new(-0.206760, -0.509657),
    Vec2::new(0.214180, -0.506584),
    Vec2::new(0.509657, -0.206760),
    Vec2::new(0.830568, 0.125528),
    Vec2::new(0.598160, 0.589750),
    Vec2::new(0.137275, 0.828707),
    Vec2::new(-0.376044, 0.751127),
    Vec2::new(-0.745727, 0.386641),
    Vec2::new(-0.830568, -0.125528),
    Vec2::new(-0.598160, -0.589750),
    Vec2::new(-0.137275, -0.828707),
    Vec2::new(0.376044, -0.751127),
    Vec2::new(0.745727, -0.386641),
];

/// Includes the centre tap.
pub const REFINE_32: [Vec2; 32] = [
    Vec2::new(0.000000, 0.000000),
    Vec2::new(0.267494, 0.082746),
    Vec2::new(0.102087, 0.260726),
    Vec2::new(-0.140194, 0.242375),
    Vec2::new(-0.276906, 0.041510),
    Vec2::new(-0.205102, -0.190613),
    Vec2::new(0.021148, -0.279200),
    Vec2::new(0.231473, -0.157544),
    Vec2::new(0.579275, 0.028988),
    Vec2::new(0.471645, 0.337566),
    Vec2::new(0.214271, 0.538969),
    Vec2::new(-0.111132, 0.569254),
    Vec2::new(-0.401252, 0.418804),
    Vec2::new(-0.563977, 0.135387),
    Vec2::new(-0.547644, -0.191014),
    Vec2::new(-0.357437, -0.456770),
    Vec2::new(-0.053747, -0.577504),
    Vec2::new(0.267008, -0.514885),
    Vec2::new(0.502989, -0.288794),
    Vec2::new(0.763497, 0.417100),
    Vec2::new(0.482207, 0.724139),
    Vec2::new(0.090449, 0.865286),
    Vec2::new(-0.322030, 0.808206),
    Vec2::new(-0.660735, 0.565976),
    Vec2::new(-0.848074, 0.194088),
    Vec2::new(-0.841130, -0.222263),
    Vec2::new(-0.641492, -0.587697),
    Vec2::new(-0.294897, -0.818496),
    Vec2::new(0.119256, -0.861788),
    Vec2::new(0.506088, -0.707654),
    Vec2::new(0.776982, -0.391406),
    Vec2::new(0.869879, 0.014509),
];

// ============================================================================
// Lookup
// ============================================================================

/// Rim samples for `count`, generated on the unit circle when no table exists.
#[must_use]
pub fn edge_samples(count: usize) -> Cow<'static, [Vec2]> {
    match count {
        4 => Cow::Borrowed(&EDGE_4),
        8 => Cow::Borrowed(&EDGE_8),
        n => Cow::Owned(
            (0..n)
                .map(|i| {
                    let angle = std::f32::consts::TAU * (i as f32 + 0.5) / n as f32;
                    Vec2::new(angle.cos(), angle.sin())
                })
                .collect(),
        ),
    }
}

/// Interior samples for `count`.
#[must_use]
pub fn refining_samples(count: usize) -> Cow<'static, [Vec2]> {
    match count {
        4 => Cow::Borrowed(&REFINE_4),
        8 => Cow::Borrowed(&REFINE_8),
        12 => Cow::Borrowed(&REFINE_12),
        16 => Cow::Borrowed(&REFINE_16),
        24 => Cow::Borrowed(&REFINE_24),
        32 => Cow::Borrowed(&REFINE_32),
        n => Cow::Owned(poisson_disk(n, 0.0, 0.9, 0.5, FALLBACK_SEED)),
    }
}

// ============================================================================
// Poisson-disk fallback
// ============================================================================

/// Places `count` samples in the annulus `[r_min, r_max]`.
///
/// A candidate is accepted when it lies at least `threshold` times the
/// expected spacing from every earlier sample. After
/// [`MAX_REPLACE_TRIES`] rejections the candidate with the largest
/// clearance is kept, so the loop always terminates.
#[must_use]
pub fn poisson_disk(count: usize, r_min: f32, r_max: f32, threshold: f32, seed: u64) -> Vec<Vec2> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (r_min, r_max) = (r_min.min(r_max).max(0.0), r_max.max(r_min));
    let area = std::f32::consts::PI * (r_max * r_max - r_min * r_min);
    let min_distance = threshold * (area / count.max(1) as f32).sqrt();

    let mut samples: Vec<Vec2> = Vec::with_capacity(count);
    for _ in 0..count {
        let mut best = Vec2::ZERO;
        let mut best_clearance = f32::MIN;
        for _ in 0..MAX_REPLACE_TRIES {
            // Uniform in area: sample r^2 rather than r.
            let r2 = rng.random_range(r_min * r_min..=r_max * r_max);
            let angle = rng.random_range(0.0..std::f32::consts::TAU);
            let candidate = Vec2::from_angle(angle) * r2.sqrt();

            let clearance = samples
                .iter()
                .map(|s| s.distance(candidate))
                .fold(f32::MAX, f32::min);
            if clearance > best_clearance {
                best = candidate;
                best_clearance = clearance;
            }
            if clearance >= min_distance {
                break;
            }
        }
        samples.push(best);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_stay_inside_unit_disk() {
        for n in [4, 8, 12, 16, 24, 32] {
            let samples = refining_samples(n);
            assert_eq!(samples.len(), n);
            assert!(samples.iter().all(|s| s.length() <= 1.0 + 1e-5), "table {n}");
        }
        for n in [4, 8] {
            assert!(edge_samples(n).iter().all(|s| (s.length() - 1.0).abs() < 1e-5));
        }
    }

    #[test]
    fn refining_tables_are_balanced() {
        // Offsets average out so a flat lit surface is not biased.
        for n in [4, 8, 12, 16, 24, 32] {
            let sum: Vec2 = refining_samples(n).iter().copied().sum();
            assert!(sum.length() < 0.05 * n as f32, "table {n} drifts by {sum:?}");
        }
    }

    #[test]
    fn poisson_fallback_respects_annulus_and_count() {
        let samples = poisson_disk(20, 0.2, 0.8, 0.7, 7);
        assert_eq!(samples.len(), 20);
        for s in &samples {
            let r = s.length();
            assert!((0.2 - 1e-4..=0.8 + 1e-4).contains(&r), "radius {r}");
        }
    }

    #[test]
    fn poisson_fallback_is_deterministic() {
        assert_eq!(poisson_disk(10, 0.0, 1.0, 0.5, 3), poisson_disk(10, 0.0, 1.0, 0.5, 3));
        assert_eq!(refining_samples(7).len(), 7);
    }
}

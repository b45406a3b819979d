//! PCF Permutations
//!
//! Shadow projection is one filter compiled into nine variants: three
//! quality levels times three ways of fetching depth.
//!
//! | Quality | Edge samples | Refining samples |
//! |---------|--------------|------------------|
//! | Low     | 4            | 4                |
//! | Medium  | 8            | 12               |
//! | High    | 8            | 24               |
//!
//! | Hardware      | Requires                          | Tap                          |
//! |---------------|-----------------------------------|------------------------------|
//! | `HardwarePcf` | comparison samplers, depth sampling | one filtered compare       |
//! | `Fetch4`      | four-texel gather, depth sampling | gather + weighted compare    |
//! | `Manual`      | nothing                           | four point fetches + weights |
//!
//! Every variant produces the same bilinear-weighted comparison per tap, so
//! swapping hardware paths never changes the image beyond float rounding.
//!
//! [`evaluate_pcf`] is the CPU reference of the filter, used by tests and by
//! hosts that need shadow values off the GPU.

use glam::{Mat2, Vec2};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::renderer::sample_tables::{edge_samples, refining_samples};
use crate::scene::ShadowFilterQuality;
use crate::settings::GpuCapabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcfHardware {
    HardwarePcf,
    Fetch4,
    Manual,
}

/// One compiled projection variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcfPermutation {
    pub quality: ShadowFilterQuality,
    pub hardware: PcfHardware,
    pub edge_samples: u32,
    pub refining_samples: u32,
}

impl PcfPermutation {
    /// Variant for a light of `quality` on a device with `caps`.
    ///
    /// Missing capabilities route to `Manual`; that is a fallback, not an
    /// error.
    #[must_use]
    pub fn select(quality: ShadowFilterQuality, caps: &GpuCapabilities) -> Self {
        let hardware = if caps.depth_textures && caps.hardware_pcf {
            PcfHardware::HardwarePcf
        } else if caps.depth_textures && caps.fetch4 {
            PcfHardware::Fetch4
        } else {
            PcfHardware::Manual
        };
        Self::new(quality, hardware)
    }

    #[must_use]
    pub const fn new(quality: ShadowFilterQuality, hardware: PcfHardware) -> Self {
        let (edge_samples, refining_samples) = match quality {
            ShadowFilterQuality::Low => (4, 4),
            ShadowFilterQuality::Medium => (8, 12),
            ShadowFilterQuality::High => (8, 24),
        };
        Self {
            quality,
            hardware,
            edge_samples,
            refining_samples,
        }
    }
}

/// Compile-time description of a projection variant.
pub trait PcfVariant {
    const PERMUTATION: PcfPermutation;
}

macro_rules! pcf_permutations {
    ($(($quality:ident, $hardware:ident)),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Projection variant: ", stringify!($quality), " quality, ", stringify!($hardware), ".")]
                #[derive(Debug, Clone, Copy, Default)]
                pub struct [<Pcf $quality $hardware>];

                impl PcfVariant for [<Pcf $quality $hardware>] {
                    const PERMUTATION: PcfPermutation =
                        PcfPermutation::new(ShadowFilterQuality::$quality, PcfHardware::$hardware);
                }
            )*

            /// Every variant, in quality-major order.
            pub const ALL_PERMUTATIONS: &[PcfPermutation] = &[
                $( [<Pcf $quality $hardware>]::PERMUTATION, )*
            ];
        }
    };
}

pcf_permutations!(
    (Low, HardwarePcf),
    (Low, Fetch4),
    (Low, Manual),
    (Medium, HardwarePcf),
    (Medium, Fetch4),
    (Medium, Manual),
    (High, HardwarePcf),
    (High, Fetch4),
    (High, Manual),
);

// ============================================================================
// CPU reference
// ============================================================================

/// Depth values of one shadow map region.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
    pub width: u32,
    pub height: u32,
    data: Vec<f32>,
}

impl DepthMap {
    /// A map cleared to the far depth.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![1.0; (width as usize) * (height as usize)],
        }
    }

    #[must_use]
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> f32) -> Self {
        let mut map = Self::new(width, height);
        for y in 0..height {
            for x in 0..width {
                map.set(x, y, f(x, y));
            }
        }
        map
    }

    pub fn set(&mut self, x: u32, y: u32, depth: f32) {
        if x < self.width && y < self.height {
            self.data[(y * self.width + x) as usize] = depth;
        }
    }

    /// Clamped texel fetch.
    #[must_use]
    pub fn texel(&self, x: i64, y: i64) -> f32 {
        if self.width == 0 || self.height == 0 {
            return 1.0;
        }
        let x = x.clamp(0, i64::from(self.width) - 1) as usize;
        let y = y.clamp(0, i64::from(self.height) - 1) as usize;
        self.data[y * self.width as usize + x]
    }

    /// The 2x2 footprint around `uv` and the bilinear weights of its right
    /// and bottom columns.
    fn footprint(&self, uv: Vec2) -> ([f32; 4], Vec2) {
        let p = uv * Vec2::new(self.width as f32, self.height as f32) - 0.5;
        let base = p.floor();
        let frac = p - base;
        let (x, y) = (base.x as i64, base.y as i64);
        (
            [
                self.texel(x, y),
                self.texel(x + 1, y),
                self.texel(x, y + 1),
                self.texel(x + 1, y + 1),
            ],
            frac,
        )
    }
}

#[inline]
fn lit(receiver: f32, stored: f32) -> f32 {
    if receiver <= stored { 1.0 } else { 0.0 }
}

#[inline]
fn bilinear(c: [f32; 4], frac: Vec2) -> f32 {
    let top = c[0] + (c[1] - c[0]) * frac.x;
    let bottom = c[2] + (c[3] - c[2]) * frac.x;
    top + (bottom - top) * frac.y
}

/// One filtered comparison at `uv`.
fn tap(hardware: PcfHardware, map: &DepthMap, uv: Vec2, receiver_depth: f32) -> f32 {
    let (depths, frac) = map.footprint(uv);
    match hardware {
        // Comparison sampler: compare each texel, then filter.
        PcfHardware::HardwarePcf => bilinear(depths.map(|d| lit(receiver_depth, d)), frac),
        // Gather returns the four depths at once; weights applied in shader.
        PcfHardware::Fetch4 => {
            let [a, b, c, d] = depths;
            let w = [
                (1.0 - frac.x) * (1.0 - frac.y),
                frac.x * (1.0 - frac.y),
                (1.0 - frac.x) * frac.y,
                frac.x * frac.y,
            ];
            w[0] * lit(receiver_depth, a)
                + w[1] * lit(receiver_depth, b)
                + w[2] * lit(receiver_depth, c)
                + w[3] * lit(receiver_depth, d)
        }
        // Four point fetches, compared and blended by hand.
        PcfHardware::Manual => {
            let results: [f32; 4] = std::array::from_fn(|i| lit(receiver_depth, depths[i]));
            bilinear(results, frac)
        }
    }
}

/// Filtered visibility of a receiver at `uv` with normalised depth
/// `receiver_depth`: `1` fully lit, `0` fully shadowed.
///
/// Edge samples are taken first on a disk of `radius_texels`; if they all
/// agree their result is returned. Otherwise the refining samples are added
/// and the average of every tap is returned. `rotation` turns the whole
/// pattern (radians).
#[must_use]
pub fn evaluate_pcf(
    permutation: PcfPermutation,
    map: &DepthMap,
    uv: Vec2,
    receiver_depth: f32,
    radius_texels: f32,
    rotation: f32,
) -> f32 {
    let rotate = Mat2::from_angle(rotation);
    let radius = Vec2::new(
        radius_texels / map.width.max(1) as f32,
        radius_texels / map.height.max(1) as f32,
    );
    let sample = |offset: Vec2| {
        tap(
            permutation.hardware,
            map,
            uv + rotate * offset * radius,
            receiver_depth,
        )
    };

    let edges = edge_samples(permutation.edge_samples as usize);
    let edge_sum: f32 = edges.iter().map(|&o| sample(o)).sum();
    let edge_count = edges.len() as f32;
    if edge_sum <= 0.0 {
        return 0.0;
    }
    if edge_sum >= edge_count {
        return 1.0;
    }

    let refining = refining_samples(permutation.refining_samples as usize);
    let refine_sum: f32 = refining.iter().map(|&o| sample(o)).sum();
    (edge_sum + refine_sum) / (edge_count + refining.len() as f32)
}

/// Statically dispatched [`evaluate_pcf`].
#[inline]
#[must_use]
pub fn filter_shadow<V: PcfVariant>(
    map: &DepthMap,
    uv: Vec2,
    receiver_depth: f32,
    radius_texels: f32,
    rotation: f32,
) -> f32 {
    evaluate_pcf(V::PERMUTATION, map, uv, receiver_depth, radius_texels, rotation)
}

// ============================================================================
// Random rotation texture
// ============================================================================

/// Tiled per-pixel pattern rotations; turns banding into noise.
#[derive(Debug, Clone)]
pub struct RotationTexture {
    size: u32,
    angles: Vec<f32>,
}

impl RotationTexture {
    pub const DEFAULT_SIZE: u32 = 16;

    #[must_use]
    pub fn new(size: u32, seed: u64) -> Self {
        let size = size.max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let angles = (0..size * size)
            .map(|_| rng.random_range(0.0..std::f32::consts::TAU))
            .collect();
        Self { size, angles }
    }

    /// Rotation for the screen pixel `(x, y)`.
    #[inline]
    #[must_use]
    pub fn angle(&self, x: u32, y: u32) -> f32 {
        self.angles[((y % self.size) * self.size + x % self.size) as usize]
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Texel data as `Rg8Unorm`: cosine and sine remapped to `0..=255`.
    #[must_use]
    pub fn to_rg8(&self) -> Vec<u8> {
        let encode = |v: f32| ((v * 0.5 + 0.5) * 255.0).round() as u8;
        self.angles
            .iter()
            .flat_map(|&a| [encode(a.cos()), encode(a.sin())])
            .collect()
    }
}

impl Default for RotationTexture {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SIZE, 0x0123_4567)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nine_distinct_permutations() {
        assert_eq!(ALL_PERMUTATIONS.len(), 9);
        for (i, a) in ALL_PERMUTATIONS.iter().enumerate() {
            for b in &ALL_PERMUTATIONS[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(PcfMediumFetch4::PERMUTATION.refining_samples, 12);
    }

    #[test]
    fn missing_capabilities_fall_back_to_manual() {
        let caps = GpuCapabilities {
            hardware_pcf: false,
            fetch4: false,
            ..Default::default()
        };
        let p = PcfPermutation::select(ShadowFilterQuality::High, &caps);
        assert_eq!(p.hardware, PcfHardware::Manual);
        assert_eq!((p.edge_samples, p.refining_samples), (8, 24));

        let no_depth = GpuCapabilities {
            depth_textures: false,
            ..Default::default()
        };
        assert_eq!(
            PcfPermutation::select(ShadowFilterQuality::Low, &no_depth).hardware,
            PcfHardware::Manual
        );
    }

    #[test]
    fn uniform_regions_take_the_early_out() {
        let map = DepthMap::new(32, 32);
        let p = PcfMediumHardwarePcf::PERMUTATION;
        assert_eq!(evaluate_pcf(p, &map, Vec2::splat(0.5), 0.5, 2.0, 0.3), 1.0);
        let occluded = DepthMap::from_fn(32, 32, |_, _| 0.2);
        assert_eq!(evaluate_pcf(p, &occluded, Vec2::splat(0.5), 0.5, 2.0, 0.3), 0.0);
    }

    #[test]
    fn edge_produces_partial_shadow() {
        let map = DepthMap::from_fn(32, 32, |x, _| if x < 16 { 0.2 } else { 1.0 });
        let v = filter_shadow::<PcfHighManual>(&map, Vec2::new(0.5, 0.5), 0.5, 3.0, 0.0);
        assert!(v > 0.1 && v < 0.9, "penumbra value {v}");
    }
}

//! Cascade Splits
//!
//! Partitioning of a view's depth range for view-dependent directional
//! shadows.
//!
//! # Distribution
//!
//! Split `i` covers `[d(i), d(i + 1))` with
//!
//! ```text
//!   d(i) = near + (far - near) * (e^i - 1) / (e^N - 1)
//! ```
//!
//! so each split is `e` times deeper than the previous one (`e` is
//! `cascade_distribution_exponent`; `e = 1` degrades to uniform splits).
//!
//! # Bounds
//!
//! Each split is bounded by the smallest sphere centred on the view axis
//! that contains the slice's near and far corner rings.

use glam::Vec3;
use smallvec::SmallVec;

use crate::math::bounds::Sphere;
use crate::scene::view::ViewInfo;

/// Maximum cascade count per directional light.
pub const MAX_CASCADES: u32 = 4;

// ============================================================================
// Split Distances
// ============================================================================

/// Far distance of each split along the view direction.
///
/// Entries past `cascade_count` are zero; the last used entry is `far`.
#[must_use]
pub fn compute_cascade_splits(
    cascade_count: u32,
    near: f32,
    far: f32,
    exponent: f32,
) -> [f32; MAX_CASCADES as usize] {
    let mut splits = [0.0f32; MAX_CASCADES as usize];
    let n = cascade_count.min(MAX_CASCADES) as usize;
    if n == 0 {
        return splits;
    }

    let exponent = exponent.max(1.0);
    let total = if (exponent - 1.0).abs() < 1e-6 {
        n as f32
    } else {
        exponent.powi(n as i32) - 1.0
    };
    for (i, split) in splits.iter_mut().enumerate().take(n) {
        let t = if (exponent - 1.0).abs() < 1e-6 {
            (i + 1) as f32
        } else {
            exponent.powi(i as i32 + 1) - 1.0
        };
        *split = near + (far - near) * t / total;
    }

    // Ensure the last split reaches the far plane
    splits[n - 1] = far;

    splits
}

// ============================================================================
// Split Bounds
// ============================================================================

/// Smallest sphere, centred on the view axis, around the frustum slice
/// `[near, far]`.
///
/// `tan_half_x` and `tan_half_y` are the tangents of the half field of view.
#[must_use]
pub fn slice_bounding_sphere(
    origin: Vec3,
    forward: Vec3,
    tan_half_x: f32,
    tan_half_y: f32,
    near: f32,
    far: f32,
) -> Sphere {
    let k = tan_half_x.hypot(tan_half_y);
    let near_diag = near * k;
    let far_diag = far * k;
    let length = (far - near).max(f32::EPSILON);

    // Equidistant point from the near and far corner rings.
    let optimal =
        (far * far + far_diag * far_diag - near * near - near_diag * near_diag) / (2.0 * length);
    let center_depth = optimal.clamp(near, far);

    let to_near = (center_depth - near).hypot(near_diag);
    let to_far = (far - center_depth).hypot(far_diag);
    Sphere::new(origin + forward * center_depth, to_near.max(to_far))
}

/// One cascade of a view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeSplit {
    pub index: u32,
    pub near: f32,
    pub far: f32,
    pub bounds: Sphere,
}

impl CascadeSplit {
    /// Half-open containment: a depth on a shared boundary belongs to the
    /// deeper split only, except for the near plane of split 0.
    #[inline]
    #[must_use]
    pub fn contains_depth(&self, depth: f32) -> bool {
        depth >= self.near && depth < self.far
    }
}

/// Splits of `view` covering `[near_clip, distance]`.
#[must_use]
pub fn view_cascades(view: &ViewInfo, count: u32, distance: f32, exponent: f32) -> SmallVec<[CascadeSplit; MAX_CASCADES as usize]> {
    let near = view.desc.near_clip;
    let far = distance.max(near + 1.0);
    let fars = compute_cascade_splits(count, near, far, exponent);

    let p = &view.desc.projection_matrix;
    let tan_half_x = 1.0 / p.x_axis.x.abs().max(f32::EPSILON);
    let tan_half_y = 1.0 / p.y_axis.y.abs().max(f32::EPSILON);
    let forward = view.desc.forward();

    let mut splits = SmallVec::new();
    let mut split_near = near;
    for (index, &split_far) in fars.iter().enumerate().take(count.min(MAX_CASCADES) as usize) {
        splits.push(CascadeSplit {
            index: index as u32,
            near: split_near,
            far: split_far,
            bounds: slice_bounding_sphere(
                view.desc.origin,
                forward,
                tan_half_x,
                tan_half_y,
                split_near,
                split_far,
            ),
        });
        split_near = split_far;
    }
    splits
}

/// The split whose depth range contains `depth` along the view direction.
#[must_use]
pub fn split_for_depth(splits: &[CascadeSplit], depth: f32) -> Option<u32> {
    splits.iter().find(|s| s.contains_depth(depth)).map(|s| s.index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_contains_slice_corners() {
        let (tx, ty) = (0.8f32, 0.45f32);
        let s = slice_bounding_sphere(Vec3::ZERO, Vec3::Z, tx, ty, 2.0, 30.0);
        for depth in [2.0f32, 30.0] {
            for (sx, sy) in [(1.0, 1.0), (-1.0, 1.0), (1.0, -1.0), (-1.0, -1.0)] {
                let corner = Vec3::new(sx * tx * depth, sy * ty * depth, depth);
                assert!(corner.distance(s.center) <= s.radius + 1e-3, "corner {corner:?} outside");
            }
        }
    }

    #[test]
    fn uniform_when_exponent_is_one() {
        let s = compute_cascade_splits(4, 0.0, 100.0, 1.0);
        assert_eq!(s, [25.0, 50.0, 75.0, 100.0]);
    }

    fn splits(near: f32, far: f32) -> Vec<CascadeSplit> {
        let fars = compute_cascade_splits(3, near, far, 2.0);
        let mut split_near = near;
        fars.iter()
            .take(3)
            .enumerate()
            .map(|(index, &split_far)| {
                let split = CascadeSplit {
                    index: index as u32,
                    near: split_near,
                    far: split_far,
                    bounds: slice_bounding_sphere(Vec3::ZERO, Vec3::Z, 1.0, 1.0, split_near, split_far),
                };
                split_near = split_far;
                split
            })
            .collect()
    }

    #[test]
    fn near_plane_depth_lies_in_first_split_only() {
        let splits = splits(0.1, 80.0);
        let containing: Vec<u32> = splits.iter().filter(|s| s.contains_depth(0.1)).map(|s| s.index).collect();
        assert_eq!(containing, vec![0]);
        assert_eq!(split_for_depth(&splits, 0.1), Some(0));
        assert_eq!(split_for_depth(&splits, 0.0999), None);
    }

    #[test]
    fn shared_boundary_belongs_to_deeper_split() {
        let splits = splits(0.1, 80.0);
        let boundary = splits[0].far;
        assert_eq!(split_for_depth(&splits, boundary), Some(1), "boundary {boundary}");
        assert_eq!(split_for_depth(&splits, 80.0), None);
    }
}

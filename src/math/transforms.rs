//! Shadow Transform Construction
//!
//! Matrix builders shared by every shadow kind.
//!
//! # Conventions
//!
//! All matrices are glam column-vector matrices (`clip = M * p`), composed
//! right to left. Light space has the light's facing direction on `+Z`.
//! Shadow clip space maps `x, y` to `[-1, 1]` and depth to `[0, 1]` after
//! the divide by `w`.

use glam::{Mat4, Vec2, Vec3, Vec4};

use super::bounds::BOX_EDGES;

/// Projected extents below this are treated as degenerate.
pub const DELTA: f32 = 1e-5;

/// Half the representable world; far planes never reach past it.
pub const HALF_WORLD_MAX: f32 = 262_144.0;

/// Full world size, used as "infinite" cast distance for directional lights.
pub const WORLD_MAX: f32 = HALF_WORLD_MAX * 2.0;

// ============================================================================
// Basis helpers
// ============================================================================

/// Two unit vectors completing `dir` to a right-handed orthonormal basis
/// `(x, y, dir)`.
#[must_use]
pub fn find_best_axis_vectors(dir: Vec3) -> (Vec3, Vec3) {
    let n = dir.normalize_or(Vec3::Z);
    let a = n.abs();
    let seed = if a.z > a.x && a.z > a.y { Vec3::X } else { Vec3::Z };
    let x = (seed - n * seed.dot(n)).normalize_or(Vec3::X);
    let y = n.cross(x);
    (x, y)
}

/// Matrix projecting a point onto three axes: `p -> (p·x, p·y, p·z)`.
#[inline]
#[must_use]
pub fn basis_matrix(x: Vec3, y: Vec3, z: Vec3) -> Mat4 {
    Mat4::from_cols(x.extend(0.0), y.extend(0.0), z.extend(0.0), Vec4::W).transpose()
}

/// Rotation taking `direction` onto `+Z`.
#[inline]
#[must_use]
pub fn light_rotation(direction: Vec3) -> Mat4 {
    let z = direction.normalize_or(Vec3::NEG_Z);
    let (x, y) = find_best_axis_vectors(z);
    basis_matrix(x, y, z)
}

// ============================================================================
// Depth remap
// ============================================================================

/// Remaps light-space depth in `[min_z, max_z]` to `[0, 1]`.
///
/// `w_axis` selects the homogeneous `w`: `(0, 0, 0, 1)` for orthographic
/// (directional) lights, `(0, 0, 1, 0)` for perspective lights where `w`
/// is the light-space depth.
#[must_use]
pub fn shadow_projection_matrix(min_z: f32, max_z: f32, w_axis: Vec4) -> Mat4 {
    let range = (max_z - min_z).max(DELTA);
    let a = (w_axis.z * max_z + w_axis.w) / range;
    Mat4::from_cols(
        Vec4::new(1.0, 0.0, 0.0, w_axis.x),
        Vec4::new(0.0, 1.0, 0.0, w_axis.y),
        Vec4::new(0.0, 0.0, a, w_axis.z),
        Vec4::new(0.0, 0.0, -min_z * a, w_axis.w),
    )
}

/// Homogeneous `w` of a light-space point under `w_axis`.
#[inline]
#[must_use]
pub fn light_space_w(p: Vec3, face_direction: Vec3, w_axis: Vec4) -> f32 {
    Vec4::new(0.0, 0.0, p.dot(face_direction), 1.0).dot(w_axis)
}

// ============================================================================
// Best-fit shadow basis
// ============================================================================

/// Result of [`best_shadow_transform`].
#[derive(Debug, Clone, Copy)]
pub struct BestShadowTransform {
    /// Scaled X axis; spans the wider side of the subject.
    pub x_axis: Vec3,
    pub y_axis: Vec3,
    pub z_axis: Vec3,
    /// Centre of the fitted rectangle in scaled units.
    pub offset: Vec2,
    /// Width over height of the fitted rectangle (always `>= 1`).
    pub aspect_ratio: f32,
}

impl BestShadowTransform {
    /// Light space to shadow space, `x, y` in `[-1, 1]` over the subject.
    ///
    /// With `perspective` set the centring offset is scaled by the light
    /// space depth, so it survives the divide by `w = z`.
    #[must_use]
    pub fn light_to_shadow(&self, perspective: bool) -> Mat4 {
        let (row_x, row_y, translation) = if perspective {
            (
                self.x_axis - self.z_axis * self.offset.x,
                self.y_axis - self.z_axis * self.offset.y,
                Vec2::ZERO,
            )
        } else {
            (self.x_axis, self.y_axis, -self.offset)
        };
        Mat4::from_cols(
            Vec4::new(row_x.x, row_y.x, self.z_axis.x, 0.0),
            Vec4::new(row_x.y, row_y.y, self.z_axis.y, 0.0),
            Vec4::new(row_x.z, row_y.z, self.z_axis.z, 0.0),
            Vec4::new(translation.x, translation.y, 0.0, 1.0),
        )
    }
}

/// Projection of the points onto one candidate axis pair.
#[derive(Clone, Copy)]
struct AxisFit {
    x: Vec3,
    y: Vec3,
    extent_x: f32,
    extent_y: f32,
    mid_x: f32,
    mid_y: f32,
}

impl AxisFit {
    fn measure(x: Vec3, y: Vec3, points: &[Vec3; 8], conservative: bool) -> Self {
        let (mut min_x, mut max_x) = (f32::MAX, f32::MIN);
        let (mut min_y, mut max_y) = (f32::MAX, f32::MIN);
        for p in points {
            let px = p.dot(x);
            let py = p.dot(y);
            min_x = min_x.min(px);
            max_x = max_x.max(px);
            min_y = min_y.min(py);
            max_y = max_y.max(py);
        }

        if conservative {
            Self {
                x,
                y,
                extent_x: 2.0 * max_x.abs().max(min_x.abs()),
                extent_y: 2.0 * max_y.abs().max(min_y.abs()),
                mid_x: 0.0,
                mid_y: 0.0,
            }
        } else {
            Self {
                x,
                y,
                extent_x: max_x - min_x,
                extent_y: max_y - min_y,
                mid_x: (min_x + max_x) * 0.5,
                mid_y: (min_y + max_y) * 0.5,
            }
        }
    }

    #[inline]
    fn area(&self) -> f32 {
        self.extent_x * self.extent_y
    }
}

/// Finds the rotation about `z_axis` whose projected rectangle around
/// `points` has the smallest area.
///
/// Candidate X axes are the box edges with their `z_axis` component removed.
/// A candidate must beat the current best by more than `0.05` to win, which
/// keeps the choice stable frame to frame. The wider side always ends up on
/// X. Returns `None` when every candidate projects to a zero area.
///
/// With `conservative` set the rectangle is centred on the light axis, so
/// corners of the world-space bounds can never fall outside it.
#[must_use]
pub fn best_shadow_transform(
    z_axis: Vec3,
    points: &[Vec3; 8],
    conservative: bool,
) -> Option<BestShadowTransform> {
    let z_axis = z_axis.normalize_or(Vec3::Z);

    let mut best: Option<AxisFit> = None;
    for (a, b) in BOX_EDGES {
        let delta = points[b] - points[a];
        let trial_x = (delta - z_axis * delta.dot(z_axis)).normalize_or_zero();
        if trial_x == Vec3::ZERO {
            continue;
        }
        let trial_y = z_axis.cross(trial_x).normalize_or_zero();

        let fit = AxisFit::measure(trial_x, trial_y, points, conservative);
        let best_area = best.map_or(f32::MAX, |b| b.area());
        if fit.area() < best_area - 0.05 && fit.area() > DELTA {
            best = Some(fit);
        }
    }

    let fit = best?;
    let mut x_axis = fit.x * (2.0 / fit.extent_x);
    let mut y_axis = fit.y * (2.0 / fit.extent_y);
    let mut offset_x = fit.mid_x * (2.0 / fit.extent_x);
    let mut offset_y = fit.mid_y * (2.0 / fit.extent_y);

    let aspect_ratio = if fit.extent_y > fit.extent_x {
        // Keep X as the major axis; negating the new X preserves handedness.
        std::mem::swap(&mut x_axis, &mut y_axis);
        std::mem::swap(&mut offset_x, &mut offset_y);
        x_axis = -x_axis;
        offset_x = -offset_x;
        fit.extent_y / fit.extent_x
    } else {
        fit.extent_x / fit.extent_y
    };

    Some(BestShadowTransform {
        x_axis,
        y_axis,
        z_axis,
        offset: Vec2::new(offset_x, offset_y),
        aspect_ratio,
    })
}

// ============================================================================
// Cube faces
// ============================================================================

/// Facing directions of the six cube faces, in `+X -X +Y -Y +Z -Z` order.
pub const CUBE_FACE_DIRECTIONS: [Vec3; 6] = [
    Vec3::X,
    Vec3::NEG_X,
    Vec3::Y,
    Vec3::NEG_Y,
    Vec3::Z,
    Vec3::NEG_Z,
];

/// Up vectors paired with [`CUBE_FACE_DIRECTIONS`].
pub const CUBE_FACE_UPS: [Vec3; 6] = [
    Vec3::Y,
    Vec3::Y,
    Vec3::NEG_Z,
    Vec3::Z,
    Vec3::Y,
    Vec3::Y,
];

/// View-projection of one cube face seen from `position`.
#[must_use]
pub fn cube_face_view_projection(position: Vec3, face: usize, near: f32, radius: f32) -> Mat4 {
    let view = Mat4::look_to_rh(position, CUBE_FACE_DIRECTIONS[face], CUBE_FACE_UPS[face]);
    let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, near, radius.max(near * 2.0));
    proj * view
}

// ============================================================================
// Integer helpers
// ============================================================================

/// Largest power of two `<= value` (0 for 0).
#[inline]
#[must_use]
pub fn floor_pow2(value: u32) -> u32 {
    if value == 0 { 0 } else { 1 << (31 - value.leading_zeros()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::bounds::Aabb;

    const EPSILON: f32 = 1e-4;

    #[test]
    fn projection_maps_range_to_unit_depth_ortho() {
        let m = shadow_projection_matrix(2.0, 10.0, Vec4::W);
        let near = m.project_point3(Vec3::new(0.0, 0.0, 2.0));
        let far = m.project_point3(Vec3::new(0.0, 0.0, 10.0));
        assert!(near.z.abs() < EPSILON, "near depth {}", near.z);
        assert!((far.z - 1.0).abs() < EPSILON, "far depth {}", far.z);
    }

    #[test]
    fn projection_maps_range_to_unit_depth_perspective() {
        let m = shadow_projection_matrix(1.0, 20.0, Vec4::Z);
        let near = m.project_point3(Vec3::new(0.5, 0.0, 1.0));
        let far = m.project_point3(Vec3::new(0.0, 0.0, 20.0));
        assert!(near.z.abs() < EPSILON, "near depth {}", near.z);
        assert!((far.z - 1.0).abs() < EPSILON, "far depth {}", far.z);
        assert!((near.x - 0.5).abs() < EPSILON, "x divided by depth");
    }

    #[test]
    fn best_axis_vectors_are_orthonormal_and_right_handed() {
        for dir in [Vec3::X, Vec3::Y, Vec3::Z, Vec3::new(1.0, -2.0, 0.5)] {
            let n = dir.normalize();
            let (x, y) = find_best_axis_vectors(n);
            assert!(x.dot(n).abs() < EPSILON);
            assert!(y.dot(n).abs() < EPSILON);
            assert!((x.cross(y) - n).length() < EPSILON);
        }
    }

    #[test]
    fn best_transform_fits_box_into_unit_square() {
        let aabb = Aabb::new(Vec3::new(-4.0, -1.0, 3.0), Vec3::new(4.0, 1.0, 5.0));
        let fit = best_shadow_transform(Vec3::Z, &aabb.corners(), false).unwrap();
        assert!((fit.aspect_ratio - 4.0).abs() < EPSILON, "aspect {}", fit.aspect_ratio);
        for c in aabb.corners() {
            let p = fit.light_to_shadow(false).transform_point3(c);
            assert!(p.x.abs() <= 1.0 + EPSILON && p.y.abs() <= 1.0 + EPSILON, "{p:?}");
        }
    }

    #[test]
    fn best_transform_keeps_x_major_when_box_is_tall() {
        let aabb = Aabb::new(Vec3::new(-1.0, -3.0, 0.0), Vec3::new(1.0, 3.0, 1.0));
        let fit = best_shadow_transform(Vec3::Z, &aabb.corners(), false).unwrap();
        assert!((fit.aspect_ratio - 3.0).abs() < EPSILON);
        // Handedness is preserved: det of the 3x3 part stays positive.
        assert!(fit.light_to_shadow(false).determinant() > 0.0);
    }

    #[test]
    fn degenerate_points_have_no_transform() {
        let points = [Vec3::new(0.0, 0.0, 1.0); 8];
        assert!(best_shadow_transform(Vec3::Z, &points, false).is_none());
    }

    #[test]
    fn floor_pow2_rounds_down() {
        assert_eq!(floor_pow2(0), 0);
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(64), 64);
        assert_eq!(floor_pow2(100), 64);
        assert_eq!(floor_pow2(1023), 512);
    }
}

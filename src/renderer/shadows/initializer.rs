//! Projection Recipes
//!
//! A [`ProjectedShadowInitializer`] holds the three staged projections of a
//! shadow before it is scheduled:
//!
//! ```text
//!   light ──► [ pre-subject ───────────────┐
//!             |  occluders in front        │
//!             [ subject ─────────┐         │
//!             |  the caster      │         │
//!             [ post-subject ────┼─────────┼──────► max cast distance
//!                receivers       ▼         ▼
//! ```
//!
//! All matrices act on *translated* world positions (`p + pre_shadow_translation`)
//! so that shadows far from the world origin keep full float precision.

use glam::{Mat4, Vec3, Vec4};

use crate::math::bounds::BoxSphereBounds;
use crate::math::transforms::{
    DELTA, HALF_WORLD_MAX, basis_matrix, best_shadow_transform, light_space_w,
    shadow_projection_matrix,
};

/// Projection recipe for one shadow.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedShadowInitializer {
    /// Added to world positions before any of the matrices apply.
    pub pre_shadow_translation: Vec3,
    /// Depth range from the light's near limit to the back of the subject.
    pub pre_subject_matrix: Mat4,
    /// Depth range tightly around the subject.
    pub subject_matrix: Mat4,
    /// Depth range from the subject's front to the cast distance.
    pub post_subject_matrix: Mat4,
    /// Subject range with the near plane pushed toward the light
    /// (directional preshadows only; equals `subject_matrix` otherwise).
    pub subject_matrix_fudged: Mat4,
    pub max_subject_depth: f32,
    pub max_pre_subject_depth: f32,
    pub min_pre_subject_z: f32,
    pub bounding_radius: f32,
    /// Width over height of the shadow's footprint.
    pub aspect_ratio: f32,
    /// Cascade index for view-dependent directional shadows.
    pub split_index: Option<u32>,
    pub directional: bool,
    pub whole_scene: bool,
}

impl ProjectedShadowInitializer {
    /// Builds the recipe for a shadow cast by a single subject.
    ///
    /// `subject_bounds` are in world space. The footprint is fitted with
    /// [`best_shadow_transform`]; `None` means the subject projects to a
    /// degenerate area.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn object(
        pre_shadow_translation: Vec3,
        world_to_light: Mat4,
        face_direction: Vec3,
        subject_bounds: &BoxSphereBounds,
        w_axis: Vec4,
        min_light_w: f32,
        max_distance_to_cast: f32,
        directional: bool,
        conservative: bool,
        near_plane_extension: f32,
    ) -> Option<Self> {
        let bounds = subject_bounds.translated(pre_shadow_translation);
        let aabb = bounds.aabb();

        let mut projected = [Vec3::splat(f32::MAX); 8];
        for (out, corner) in projected.iter_mut().zip(aabb.corners()) {
            let p = world_to_light.transform_point3(corner);
            let w = light_space_w(p, face_direction, w_axis);
            if w >= DELTA {
                *out = p / w;
            }
        }

        let fit = best_shadow_transform(face_direction, &projected, conservative)?;
        let perspective = w_axis.z != 0.0;
        let world_to_shadow = fit.light_to_shadow(perspective) * world_to_light;

        let shadow_box = aabb.transform_by(&world_to_shadow);
        let clamped_min_z = min_light_w.max(shadow_box.min.z);
        let clamped_max_z = (clamped_min_z + max_distance_to_cast).min(HALF_WORLD_MAX);

        let pre_subject_matrix =
            shadow_projection_matrix(min_light_w, shadow_box.max.z, w_axis) * world_to_shadow;
        let subject_matrix =
            shadow_projection_matrix(clamped_min_z, shadow_box.max.z, w_axis) * world_to_shadow;
        let post_subject_matrix =
            shadow_projection_matrix(clamped_min_z, clamped_max_z, w_axis) * world_to_shadow;

        let max_subject_depth = aabb.transform_by(&subject_matrix).max.z;
        let max_pre_subject_depth = if directional {
            max_subject_depth
        } else {
            aabb.transform_by(&pre_subject_matrix).max.z
        };

        let subject_matrix_fudged = if directional {
            let z_length = shadow_box.max.z - shadow_box.min.z;
            let pushed_min_z =
                min_light_w.max(shadow_box.min.z - z_length * near_plane_extension);
            shadow_projection_matrix(pushed_min_z, shadow_box.max.z, w_axis) * world_to_shadow
        } else {
            subject_matrix
        };

        Some(Self {
            pre_shadow_translation,
            pre_subject_matrix,
            subject_matrix,
            post_subject_matrix,
            subject_matrix_fudged,
            max_subject_depth,
            max_pre_subject_depth,
            min_pre_subject_z: min_light_w,
            bounding_radius: bounds.sphere_radius,
            aspect_ratio: fit.aspect_ratio,
            split_index: None,
            directional,
            whole_scene: false,
        })
    }

    /// Builds the recipe for a shadow covering everything inside
    /// `subject_bounds` (already relative to the translated origin).
    ///
    /// With `snap_resolution` set, the translation is snapped to the texel
    /// grid of a map of that size so that camera motion never shifts the
    /// shadow by a fraction of a texel.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn whole_scene(
        pre_shadow_translation: Vec3,
        world_to_light: Mat4,
        face_direction: Vec3,
        x_axis: Vec3,
        y_axis: Vec3,
        subject_bounds: &BoxSphereBounds,
        w_axis: Vec4,
        min_light_w: f32,
        max_distance_to_cast: f32,
        snap_resolution: Option<u32>,
    ) -> Self {
        let face = face_direction.normalize_or(Vec3::Z);
        let world_to_face = basis_matrix(x_axis, y_axis, face) * world_to_light;
        let radius = subject_bounds.sphere_radius;

        let max_subject_z = world_to_face.transform_point3(subject_bounds.origin).z + radius;
        let min_subject_z = (max_subject_z - radius * 2.0).max(min_light_w);
        let clamped_max_light_w = (min_subject_z + max_distance_to_cast).min(HALF_WORLD_MAX);

        let pre_subject_matrix =
            shadow_projection_matrix(min_light_w, max_subject_z, w_axis) * world_to_face;
        let subject_matrix =
            shadow_projection_matrix(min_subject_z, max_subject_z, w_axis) * world_to_face;
        let post_subject_matrix =
            shadow_projection_matrix(min_subject_z, clamped_max_light_w, w_axis) * world_to_face;

        let pre_shadow_translation = match snap_resolution {
            Some(resolution) if resolution > 0 => {
                snap_translation(pre_shadow_translation, &world_to_face, resolution)
            }
            _ => pre_shadow_translation,
        };

        let far_point = subject_bounds.origin
            + world_to_light.inverse().transform_vector3(face) * radius;
        let max_subject_depth = (subject_matrix * far_point.extend(1.0)).z;
        let max_pre_subject_depth = (pre_subject_matrix * far_point.extend(1.0)).z;

        Self {
            pre_shadow_translation,
            pre_subject_matrix,
            subject_matrix,
            post_subject_matrix,
            subject_matrix_fudged: subject_matrix,
            max_subject_depth,
            max_pre_subject_depth,
            min_pre_subject_z: min_light_w,
            bounding_radius: radius,
            aspect_ratio: 1.0,
            split_index: None,
            directional: w_axis.z == 0.0,
            whole_scene: true,
        }
    }
}

/// Moves the shadow origin onto the `2 / resolution` grid in face space.
fn snap_translation(pre_shadow_translation: Vec3, world_to_face: &Mat4, resolution: u32) -> Vec3 {
    let step = 2.0 / resolution as f32;
    let position = world_to_face.transform_point3(-pre_shadow_translation);
    let snap = Vec3::new(position.x % step, position.y % step, 0.0);
    -world_to_face.inverse().transform_point3(position - snap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::transforms::WORLD_MAX;

    const EPSILON: f32 = 1e-3;

    fn directional_object() -> ProjectedShadowInitializer {
        let bounds = BoxSphereBounds::from_sphere(Vec3::new(3.0, 0.0, 0.0), 1.0);
        ProjectedShadowInitializer::object(
            -bounds.origin,
            Mat4::IDENTITY,
            Vec3::Z,
            &bounds,
            Vec4::W,
            -HALF_WORLD_MAX,
            WORLD_MAX,
            true,
            false,
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn subject_matrix_maps_subject_into_unit_depth() {
        let init = directional_object();
        let near = init.subject_matrix.project_point3(Vec3::new(0.0, 0.0, -1.0));
        let far = init.subject_matrix.project_point3(Vec3::new(0.0, 0.0, 1.0));
        assert!(near.z.abs() < EPSILON, "near {}", near.z);
        assert!((far.z - 1.0).abs() < EPSILON, "far {}", far.z);
        assert!((init.max_subject_depth - 1.0).abs() < EPSILON);
    }

    #[test]
    fn fudged_matrix_pushes_near_plane_toward_light() {
        let init = directional_object();
        let p = Vec3::new(0.0, 0.0, -2.0);
        let z_subject = init.subject_matrix.project_point3(p).z;
        let z_fudged = init.subject_matrix_fudged.project_point3(p).z;
        assert!(z_subject < 0.0, "point before the subject is clipped");
        assert!(z_fudged >= 0.0, "fudged range includes it: {z_fudged}");
    }

    #[test]
    fn snapping_lands_on_texel_grid() {
        let bounds = BoxSphereBounds::from_sphere(Vec3::ZERO, 1.0);
        let scale = Mat4::from_scale(Vec3::splat(0.1));
        let init = ProjectedShadowInitializer::whole_scene(
            -Vec3::new(3.217, -1.933, 4.0),
            scale,
            Vec3::Z,
            Vec3::X,
            Vec3::Y,
            &bounds,
            Vec4::W,
            -HALF_WORLD_MAX,
            WORLD_MAX,
            Some(512),
        );
        let step = 2.0 / 512.0;
        let p = scale.transform_point3(-init.pre_shadow_translation);
        let rx = (p.x / step).round() * step - p.x;
        let ry = (p.y / step).round() * step - p.y;
        assert!(rx.abs() < 1e-4 && ry.abs() < 1e-4, "off grid by ({rx}, {ry})");
    }
}

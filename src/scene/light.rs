//! Lights
//!
//! A [`LightDesc`] is what the scene thread sends; [`LightSceneInfo`] is the
//! render-side record built from it. Besides the descriptive data the scene
//! info knows how to build projection recipes for each shadow form the
//! light supports.
//!
//! | Light       | Per-object | Whole-scene                          |
//! |-------------|------------|--------------------------------------|
//! | Directional | ortho      | view-dependent cascades              |
//! | Spot        | perspective| one perspective shadow over the cone |
//! | Point       | perspective| cube (one pass or six faces)         |

use bitflags::bitflags;
use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use super::{LightId, PrimitiveKey};
use crate::math::bounds::{BoxSphereBounds, Sphere};
use crate::math::transforms::{HALF_WORLD_MAX, WORLD_MAX, basis_matrix, find_best_axis_vectors};
use crate::renderer::shadows::initializer::ProjectedShadowInitializer;
use crate::settings::ShadowSettings;

bitflags! {
    /// Shadowing behaviour of a light.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LightFlags: u32 {
        const CAST_SHADOWS                  = 1 << 0;
        const CAST_STATIC_SHADOWS           = 1 << 1;
        const CAST_DYNAMIC_SHADOWS          = 1 << 2;
        /// Shadowing is precomputed for static primitives (stationary light).
        const STATIC_SHADOWING              = 1 << 3;
        /// Competes with other dominant lights for each primitive.
        const DOMINANT                      = 1 << 4;
        /// Per-object shadows land on their own subject only.
        const SELF_SHADOW_ONLY              = 1 << 5;
        /// Modulated lights shadow a subject's own pixels with attenuation
        /// and modulate everything else.
        const NON_MODULATED_SELF_SHADOWING  = 1 << 6;
        /// Directional lights: render view-dependent cascades.
        const WHOLE_SCENE_DYNAMIC_SHADOWS   = 1 << 7;
        /// Static occluders may cast preshadows onto dynamic primitives.
        const ALLOW_PRESHADOW               = 1 << 8;
    }
}

bitflags! {
    /// Channels a light affects; receivers outside them are left unshadowed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LightingChannels: u32 {
        const BSP          = 1 << 0;
        const STATIC       = 1 << 1;
        const DYNAMIC      = 1 << 2;
        const CINEMATIC_1  = 1 << 3;
        const CINEMATIC_2  = 1 << 4;
        const GAMEPLAY_1   = 1 << 5;
        const GAMEPLAY_2   = 1 << 6;
    }
}

impl Default for LightingChannels {
    fn default() -> Self {
        Self::BSP | Self::STATIC | Self::DYNAMIC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LightType {
    Directional,
    Point,
    /// Cone half-angles in radians.
    Spot { inner_cone_angle: f32, outer_cone_angle: f32 },
}

/// How a projected shadow is composited.
///
/// `Modulate` multiplies already-lit scene color by the light's shadow
/// color; the older "modulate better" mode maps onto it when deserialising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShadowProjectionMode {
    #[default]
    Normal,
    #[serde(alias = "ModulateBetter")]
    Modulate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ShadowFilterQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl ShadowFilterQuality {
    /// Applies a global bias, saturating at both ends.
    #[must_use]
    pub fn biased(self, bias: i32) -> Self {
        match (self as i32 + bias).clamp(0, 2) {
            0 => Self::Low,
            1 => Self::Medium,
            _ => Self::High,
        }
    }
}

// ============================================================================
// LightDesc
// ============================================================================

/// Everything the scene thread knows about a light.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightDesc {
    pub id: LightId,
    pub light_type: LightType,
    pub position: Vec3,
    /// Direction the light travels (unused for point lights).
    pub direction: Vec3,
    /// Influence radius (ignored for directional lights).
    pub radius: f32,
    pub color: Vec3,
    pub brightness: f32,
    pub falloff_exponent: f32,
    pub flags: LightFlags,
    pub projection_mode: ShadowProjectionMode,
    pub filter_quality: ShadowFilterQuality,
    pub lighting_channels: LightingChannels,
    /// Color multiplied into the scene for modulated shadows.
    pub mod_shadow_color: Vec4,
    /// Seconds for a modulated shadow to fade in or out (0 disables).
    pub mod_shadow_fadeout_time: f32,
    pub mod_shadow_fadeout_exponent: f32,
    /// Per-light overrides; 0 means "use the global setting".
    pub min_shadow_resolution: u32,
    pub max_shadow_resolution: u32,
    pub shadow_fade_resolution: u32,
    /// Added to the global depth bias.
    pub depth_bias: f32,
}

impl LightDesc {
    fn base(light_type: LightType) -> Self {
        Self {
            id: LightId::next(),
            light_type,
            position: Vec3::ZERO,
            direction: Vec3::NEG_Z,
            radius: 1024.0,
            color: Vec3::ONE,
            brightness: 1.0,
            falloff_exponent: 2.0,
            flags: LightFlags::CAST_SHADOWS
                | LightFlags::CAST_STATIC_SHADOWS
                | LightFlags::CAST_DYNAMIC_SHADOWS,
            projection_mode: ShadowProjectionMode::Normal,
            filter_quality: ShadowFilterQuality::Medium,
            lighting_channels: LightingChannels::default(),
            mod_shadow_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            mod_shadow_fadeout_time: 0.0,
            mod_shadow_fadeout_exponent: 3.0,
            min_shadow_resolution: 0,
            max_shadow_resolution: 0,
            shadow_fade_resolution: 0,
            depth_bias: 0.0,
        }
    }

    #[must_use]
    pub fn directional(direction: Vec3) -> Self {
        Self {
            direction: direction.normalize_or(Vec3::NEG_Z),
            ..Self::base(LightType::Directional)
        }
    }

    #[must_use]
    pub fn point(position: Vec3, radius: f32) -> Self {
        Self {
            position,
            radius,
            ..Self::base(LightType::Point)
        }
    }

    #[must_use]
    pub fn spot(position: Vec3, direction: Vec3, radius: f32, outer_cone_angle: f32) -> Self {
        Self {
            position,
            direction: direction.normalize_or(Vec3::NEG_Z),
            radius,
            ..Self::base(LightType::Spot {
                inner_cone_angle: outer_cone_angle * 0.8,
                outer_cone_angle,
            })
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: LightFlags) -> Self {
        self.flags |= flags;
        self
    }
}

// ============================================================================
// LightSceneInfo
// ============================================================================

/// Render-side light record.
#[derive(Debug, Clone)]
pub struct LightSceneInfo {
    pub desc: LightDesc,
    /// Primitives this light interacts with.
    pub interactions: Vec<PrimitiveKey>,
}

impl LightSceneInfo {
    #[must_use]
    pub fn new(desc: LightDesc) -> Self {
        Self {
            desc,
            interactions: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> LightId {
        self.desc.id
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> LightFlags {
        self.desc.flags
    }

    #[inline]
    #[must_use]
    pub fn is_directional(&self) -> bool {
        matches!(self.desc.light_type, LightType::Directional)
    }

    #[inline]
    #[must_use]
    pub fn is_point(&self) -> bool {
        matches!(self.desc.light_type, LightType::Point)
    }

    #[inline]
    #[must_use]
    pub fn is_dominant(&self) -> bool {
        self.desc.flags.contains(LightFlags::DOMINANT)
    }

    #[inline]
    #[must_use]
    pub fn has_static_shadowing(&self) -> bool {
        self.desc.flags.contains(LightFlags::STATIC_SHADOWING)
    }

    /// Whole-scene shadows were requested and no self-shadowing mode
    /// restricts the light to per-object shadows.
    #[must_use]
    pub fn wants_whole_scene_shadows(&self) -> bool {
        let f = self.desc.flags;
        f.contains(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS)
            && !f.intersects(LightFlags::SELF_SHADOW_ONLY | LightFlags::NON_MODULATED_SELF_SHADOWING)
    }

    #[inline]
    #[must_use]
    pub fn non_modulated_self_shadowing(&self) -> bool {
        self.desc.flags.contains(LightFlags::NON_MODULATED_SELF_SHADOWING)
    }

    /// Whether the light casts any kind of shadow.
    #[must_use]
    pub fn casts_shadows(&self) -> bool {
        let f = self.desc.flags;
        f.contains(LightFlags::CAST_SHADOWS)
            && f.intersects(LightFlags::CAST_STATIC_SHADOWS | LightFlags::CAST_DYNAMIC_SHADOWS)
    }

    /// Origin used for screen-size estimates of whole-scene shadows.
    #[must_use]
    pub fn origin(&self) -> Vec3 {
        self.desc.position
    }

    #[must_use]
    pub fn bounding_sphere(&self) -> Option<Sphere> {
        (!self.is_directional()).then(|| Sphere::new(self.desc.position, self.desc.radius))
    }

    /// Conservative influence test.
    #[must_use]
    pub fn affects_bounds(&self, bounds: &BoxSphereBounds) -> bool {
        match self.desc.light_type {
            LightType::Directional => true,
            LightType::Point => {
                let r = self.desc.radius + bounds.sphere_radius;
                bounds.origin.distance_squared(self.desc.position) <= r * r
            }
            LightType::Spot {
                outer_cone_angle, ..
            } => {
                let r = self.desc.radius + bounds.sphere_radius;
                let to_bounds = bounds.origin - self.desc.position;
                if to_bounds.length_squared() > r * r {
                    return false;
                }
                // Sphere against cone: widen the cone by the sphere's angular size.
                let dist = to_bounds.length();
                if dist <= bounds.sphere_radius {
                    return true;
                }
                let cos_angle = to_bounds.dot(self.desc.direction) / dist;
                let half_angle = (bounds.sphere_radius / dist).clamp(-1.0, 1.0).asin();
                cos_angle >= (outer_cone_angle + half_angle).min(std::f32::consts::PI).cos()
            }
        }
    }

    /// Unshadowed intensity at `point`, used to rank dominant lights.
    #[must_use]
    pub fn intensity_at(&self, point: Vec3) -> f32 {
        let attenuation = match self.desc.light_type {
            LightType::Directional => 1.0,
            LightType::Point | LightType::Spot { .. } => {
                let d = point.distance(self.desc.position) / self.desc.radius.max(f32::EPSILON);
                (1.0 - d * d).max(0.0).powf(self.desc.falloff_exponent)
            }
        };
        self.desc.brightness * attenuation
    }

    /// Per-object projection recipe for a subject with `bounds`.
    ///
    /// Returns `None` when the light sits inside the subject, where no
    /// single frustum can cover it.
    #[must_use]
    pub fn per_object_initializer(
        &self,
        bounds: &BoxSphereBounds,
        settings: &ShadowSettings,
    ) -> Option<ProjectedShadowInitializer> {
        let conservative = settings.use_conservative_shadow_bounds;
        let extension = settings.directional_light_preshadow_near_plane_extension_factor;
        match self.desc.light_type {
            LightType::Directional => {
                let (x, y) = find_best_axis_vectors(self.desc.direction);
                let scale = 1.0 / bounds.sphere_radius.max(f32::EPSILON);
                let world_to_light =
                    Mat4::from_scale(Vec3::splat(scale)) * basis_matrix(x, y, self.desc.direction);
                ProjectedShadowInitializer::object(
                    -bounds.origin,
                    world_to_light,
                    Vec3::Z,
                    bounds,
                    Vec4::W,
                    -HALF_WORLD_MAX,
                    WORLD_MAX,
                    true,
                    conservative,
                    extension,
                )
            }
            LightType::Point | LightType::Spot { .. } => {
                const SHADOW_RADIUS_MULTIPLIER: f32 = 1.1;

                let light_vector = bounds.origin - self.desc.position;
                let distance = light_vector.length();
                if distance <= bounds.sphere_radius * SHADOW_RADIUS_MULTIPLIER {
                    return None;
                }
                let silhouette = (bounds.sphere_radius
                    / ((distance - bounds.sphere_radius) * (distance + bounds.sphere_radius)).sqrt())
                .min(1.0);

                let z = light_vector / distance;
                let (x, y) = find_best_axis_vectors(z);
                let world_to_light = Mat4::from_scale(Vec3::new(1.0 / silhouette, 1.0 / silhouette, 1.0))
                    * basis_matrix(x, y, z);
                ProjectedShadowInitializer::object(
                    -self.desc.position,
                    world_to_light,
                    Vec3::Z,
                    bounds,
                    Vec4::Z,
                    0.1,
                    self.desc.radius,
                    false,
                    conservative,
                    extension,
                )
            }
        }
    }

    /// Whole-scene recipe for a spot light covering its entire cone.
    #[must_use]
    pub fn spot_whole_scene_initializer(&self) -> Option<ProjectedShadowInitializer> {
        let LightType::Spot {
            outer_cone_angle, ..
        } = self.desc.light_type
        else {
            return None;
        };
        let tan = outer_cone_angle.clamp(0.01, 1.5).tan();
        let z = self.desc.direction;
        let (x, y) = find_best_axis_vectors(z);
        let world_to_light =
            Mat4::from_scale(Vec3::new(1.0 / tan, 1.0 / tan, 1.0)) * basis_matrix(x, y, z);
        let bounds = BoxSphereBounds::from_sphere(Vec3::ZERO, self.desc.radius);
        Some(ProjectedShadowInitializer::whole_scene(
            -self.desc.position,
            world_to_light,
            Vec3::Z,
            Vec3::X,
            Vec3::Y,
            &bounds,
            Vec4::Z,
            0.1,
            self.desc.radius,
            None,
        ))
    }

    /// Whole-scene recipe for one cube face of a point light.
    #[must_use]
    pub fn cube_face_initializer(&self, face: usize) -> ProjectedShadowInitializer {
        use crate::math::transforms::{CUBE_FACE_DIRECTIONS, CUBE_FACE_UPS};

        let z = CUBE_FACE_DIRECTIONS[face];
        let y = CUBE_FACE_UPS[face];
        let x = y.cross(z);
        let bounds = BoxSphereBounds::from_sphere(Vec3::ZERO, self.desc.radius);
        ProjectedShadowInitializer::whole_scene(
            -self.desc.position,
            Mat4::IDENTITY,
            z,
            x,
            y,
            &bounds,
            Vec4::Z,
            0.1,
            self.desc.radius,
            None,
        )
    }

    /// Recipe shared by the one-pass cube shadow; depths are rendered with
    /// the per-face matrices instead.
    #[must_use]
    pub fn one_pass_point_initializer(&self) -> ProjectedShadowInitializer {
        let mut init = self.cube_face_initializer(4);
        init.max_subject_depth = self.desc.radius;
        init
    }

    /// Recipe for cascade `split` of a directional light, covering `split_bounds`.
    #[must_use]
    pub fn cascade_initializer(
        &self,
        split_bounds: Sphere,
        split: u32,
        resolution: u32,
    ) -> Option<ProjectedShadowInitializer> {
        if !self.is_directional() || split_bounds.radius <= 0.0 {
            return None;
        }
        let (x, y) = find_best_axis_vectors(self.desc.direction);
        let scale = 1.0 / split_bounds.radius;
        let world_to_light =
            Mat4::from_scale(Vec3::splat(scale)) * basis_matrix(x, y, self.desc.direction);
        let bounds = BoxSphereBounds::from_sphere(Vec3::ZERO, split_bounds.radius * scale);
        let mut init = ProjectedShadowInitializer::whole_scene(
            -split_bounds.center,
            world_to_light,
            Vec3::Z,
            Vec3::X,
            Vec3::Y,
            &bounds,
            Vec4::W,
            -HALF_WORLD_MAX,
            WORLD_MAX,
            Some(resolution),
        );
        init.split_index = Some(split);
        init.directional = true;
        Some(init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_cone_rejects_bounds_behind_light() {
        let light = LightSceneInfo::new(LightDesc::spot(Vec3::ZERO, Vec3::NEG_Z, 100.0, 0.5));
        let ahead = BoxSphereBounds::from_sphere(Vec3::new(0.0, 0.0, -20.0), 1.0);
        let behind = BoxSphereBounds::from_sphere(Vec3::new(0.0, 0.0, 20.0), 1.0);
        assert!(light.affects_bounds(&ahead));
        assert!(!light.affects_bounds(&behind));
    }

    #[test]
    fn point_light_inside_subject_has_no_per_object_shadow() {
        let light = LightSceneInfo::new(LightDesc::point(Vec3::ZERO, 50.0));
        let around = BoxSphereBounds::from_sphere(Vec3::new(0.5, 0.0, 0.0), 2.0);
        assert!(light.per_object_initializer(&around, &ShadowSettings::default()).is_none());
    }

    #[test]
    fn quality_bias_saturates() {
        assert_eq!(ShadowFilterQuality::Low.biased(-3), ShadowFilterQuality::Low);
        assert_eq!(ShadowFilterQuality::Medium.biased(1), ShadowFilterQuality::High);
        assert_eq!(ShadowFilterQuality::High.biased(5), ShadowFilterQuality::High);
    }

    #[test]
    fn intensity_falls_off_to_zero_at_radius() {
        let light = LightSceneInfo::new(LightDesc::point(Vec3::ZERO, 10.0));
        assert!(light.intensity_at(Vec3::new(1.0, 0.0, 0.0)) > 0.5);
        assert!(light.intensity_at(Vec3::new(10.0, 0.0, 0.0)).abs() < 1e-6);
    }

    #[test]
    fn self_shadowing_modes_disable_whole_scene_shadows() {
        let sun = LightDesc::directional(Vec3::NEG_Y).with_flags(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS);
        assert!(LightSceneInfo::new(sun.clone()).wants_whole_scene_shadows());
        for mode in [LightFlags::SELF_SHADOW_ONLY, LightFlags::NON_MODULATED_SELF_SHADOWING] {
            let light = LightSceneInfo::new(sun.clone().with_flags(mode));
            assert!(!light.wants_whole_scene_shadows(), "{mode:?}");
        }
    }

    #[test]
    fn light_desc_round_trips_through_json() {
        let mut desc = LightDesc::spot(Vec3::new(1.0, 2.0, 3.0), Vec3::NEG_Z, 40.0, 0.6)
            .with_flags(LightFlags::SELF_SHADOW_ONLY | LightFlags::NON_MODULATED_SELF_SHADOWING);
        desc.projection_mode = ShadowProjectionMode::Modulate;
        let json = serde_json::to_string(&desc).unwrap();
        let back: LightDesc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc, "json: {json}");
        assert!(back.flags.contains(LightFlags::NON_MODULATED_SELF_SHADOWING));
    }
}

//! Views
//!
//! [`ViewDesc`] is the per-frame camera input; [`ViewInfo`] is what the
//! renderer derives from it during the visibility pass and then hands to
//! shadow setup, gathering and projection.

use bitflags::bitflags;
use glam::{Mat4, UVec2, Vec3, Vec4};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use super::primitive::{PrimitiveRelevance, StaticMeshId};
use super::PrimitiveKey;
use crate::errors::{Result, ShadowError};
use crate::math::frustum::ConvexVolume;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ShowFlags: u32 {
        const SHADOWS             = 1 << 0;
        const WIREFRAME           = 1 << 1;
        const BOUNDS              = 1 << 2;
        /// Report the frustums of every shadow for debug drawing.
        const SHADOW_FRUSTUMS     = 1 << 3;
        /// Report preshadow frustums only.
        const PRESHADOW_FRUSTUMS  = 1 << 4;
    }
}

impl Default for ShowFlags {
    fn default() -> Self {
        Self::SHADOWS
    }
}

/// Handle of a persistent per-view state (occlusion histories).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewStateId(pub u32);

// ============================================================================
// ViewDesc
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDesc {
    pub view_matrix: Mat4,
    /// Clip depth in `[0, 1]`.
    pub projection_matrix: Mat4,
    pub origin: Vec3,
    /// Size in pixels.
    pub size: UVec2,
    pub near_clip: f32,
    /// Scales distances for LOD selection (zoomed views use less than 1).
    pub lod_distance_factor: f32,
    pub show_flags: ShowFlags,
    /// Occlusion state; views without one treat everything as visible.
    pub state: Option<ViewStateId>,
    /// Mirror plane `(n, d)` with `n·p + d = 0` for planar reflection views.
    pub reflection_plane: Option<Vec4>,
}

impl ViewDesc {
    /// Perspective view at `origin` looking along `forward`.
    ///
    /// The far plane is at infinity.
    #[must_use]
    pub fn perspective(origin: Vec3, forward: Vec3, fov_y: f32, size: UVec2, near_clip: f32) -> Self {
        let forward = forward.normalize_or(Vec3::NEG_Z);
        let up = if forward.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
        let aspect = size.x.max(1) as f32 / size.y.max(1) as f32;
        Self {
            view_matrix: Mat4::look_to_rh(origin, forward, up),
            projection_matrix: Mat4::perspective_infinite_rh(fov_y, aspect, near_clip),
            origin,
            size,
            near_clip,
            lod_distance_factor: 1.0,
            show_flags: ShowFlags::default(),
            state: None,
            reflection_plane: None,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: ViewStateId) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix * self.view_matrix
    }

    /// Unit vector the view looks along.
    #[must_use]
    pub fn forward(&self) -> Vec3 {
        -self.view_matrix.inverse().z_axis.truncate().normalize_or(Vec3::Z)
    }
}

// ============================================================================
// ViewInfo
// ============================================================================

/// Derived per-frame view state.
#[derive(Debug, Clone)]
pub struct ViewInfo {
    pub index: usize,
    pub desc: ViewDesc,
    pub view_projection: Mat4,
    pub inv_view_projection: Mat4,
    pub frustum: ConvexVolume,

    pub primitive_visibility: FxHashSet<PrimitiveKey>,
    pub primitive_relevance: FxHashMap<PrimitiveKey, PrimitiveRelevance>,
    /// Static mesh elements drawn by this view's main pass.
    pub static_mesh_visibility: FxHashSet<StaticMeshId>,
    /// Visible primitives drawn through the dynamic path.
    pub visible_dynamic_primitives: Vec<PrimitiveKey>,

    /// Indexed by shadow id.
    pub projected_shadow_visibility: Vec<bool>,
    pub projected_shadow_relevance: Vec<PrimitiveRelevance>,
}

impl ViewInfo {
    pub fn new(index: usize, desc: ViewDesc) -> Result<Self> {
        if desc.size.x == 0 || desc.size.y == 0 {
            return Err(ShadowError::InvalidView(format!("view {index} has zero size")));
        }
        let view_projection = desc.view_projection();
        let det = view_projection.determinant();
        if !det.is_finite() || det.abs() < f32::MIN_POSITIVE {
            return Err(ShadowError::InvalidView(format!(
                "view {index} has a singular view-projection"
            )));
        }
        Ok(Self {
            index,
            inv_view_projection: view_projection.inverse(),
            frustum: ConvexVolume::from_matrix(&view_projection, true),
            view_projection,
            desc,
            primitive_visibility: FxHashSet::default(),
            primitive_relevance: FxHashMap::default(),
            static_mesh_visibility: FxHashSet::default(),
            visible_dynamic_primitives: Vec::new(),
            projected_shadow_visibility: Vec::new(),
            projected_shadow_relevance: Vec::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn is_visible(&self, primitive: PrimitiveKey) -> bool {
        self.primitive_visibility.contains(&primitive)
    }

    #[inline]
    #[must_use]
    pub fn relevance(&self, primitive: PrimitiveKey) -> PrimitiveRelevance {
        self.primitive_relevance.get(&primitive).copied().unwrap_or_default()
    }

    #[inline]
    #[must_use]
    pub fn world_to_clip(&self, p: Vec3) -> Vec4 {
        self.view_projection * p.extend(1.0)
    }

    /// Projected radius in pixels of a sphere at `origin`.
    ///
    /// `w` is clamped to 1 so spheres around the eye don't blow up.
    #[must_use]
    pub fn screen_radius(&self, origin: Vec3, radius: f32) -> f32 {
        let w = self.world_to_clip(origin).w.max(1.0);
        let p = &self.desc.projection_matrix;
        let scale = (self.desc.size.x as f32 * 0.5 * p.x_axis.x)
            .max(self.desc.size.y as f32 * 0.5 * p.y_axis.y);
        scale * radius / w
    }

    /// Projected radius as a fraction of the half screen.
    #[must_use]
    pub fn screen_percent(&self, origin: Vec3, radius: f32) -> f32 {
        let w = self.world_to_clip(origin).w.max(1.0);
        let p = &self.desc.projection_matrix;
        let scale = (0.5 * p.x_axis.x).max(0.5 * p.y_axis.y);
        scale * radius / w
    }

    /// Whether `primitive` shows up in this view with `relevance`.
    #[must_use]
    pub fn has_relevance(&self, primitive: PrimitiveKey, relevance: PrimitiveRelevance) -> bool {
        self.relevance(primitive).intersects(relevance)
    }

    /// Mirrored copy of this view for a planar reflection.
    #[must_use]
    pub fn reflected(&self, plane: Vec4) -> Option<Mat4> {
        let n = plane.truncate();
        if n.length_squared() < 1e-6 {
            return None;
        }
        let n = n.normalize();
        let d = plane.w / plane.truncate().length();
        // Householder reflection about n·p + d = 0.
        let m = Mat4::from_cols(
            (Vec3::X - 2.0 * n.x * n).extend(0.0),
            (Vec3::Y - 2.0 * n.y * n).extend(0.0),
            (Vec3::Z - 2.0 * n.z * n).extend(0.0),
            (-2.0 * d * n).extend(1.0),
        );
        Some(self.view_projection * m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_view_rejected() {
        let desc = ViewDesc::perspective(Vec3::ZERO, Vec3::X, 1.0, UVec2::new(0, 720), 1.0);
        assert!(ViewInfo::new(0, desc).is_err());
    }

    #[test]
    fn screen_radius_shrinks_with_distance() {
        let desc = ViewDesc::perspective(Vec3::ZERO, Vec3::X, 1.2, UVec2::new(1280, 720), 1.0);
        let view = ViewInfo::new(0, desc).unwrap();
        let near = view.screen_radius(Vec3::new(10.0, 0.0, 0.0), 1.0);
        let far = view.screen_radius(Vec3::new(100.0, 0.0, 0.0), 1.0);
        assert!(near > far * 9.0, "near {near} far {far}");
    }

    #[test]
    fn forward_matches_construction() {
        let desc = ViewDesc::perspective(Vec3::ZERO, Vec3::X, 1.2, UVec2::new(64, 64), 1.0);
        assert!((desc.forward() - Vec3::X).length() < 1e-5);
    }
}

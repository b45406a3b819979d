//! Primitives
//!
//! Renderable objects as the shadow pipeline sees them: bounds, shadow
//! flags, view relevance and the static mesh elements that can be drawn
//! into a depth map without going through the dynamic path.

use bitflags::bitflags;
use glam::Vec3;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use super::{LightId, LightKey, LightingChannels, PrimitiveId};
use crate::math::bounds::BoxSphereBounds;
use crate::rhi::MeshHandle;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PrimitiveFlags: u32 {
        /// Lit by precomputed shadowing from stationary lights.
        const STATIC_SHADOWING                = 1 << 0;
        const CAST_SHADOW                     = 1 << 1;
        const CAST_DYNAMIC_SHADOW             = 1 << 2;
        const CAST_STATIC_SHADOW              = 1 << 3;
        /// Shadows only itself, never other receivers.
        const SELF_SHADOW_ONLY                = 1 << 4;
        /// May receive a preshadow from static occluders.
        const ALLOW_PRESHADOW                 = 1 << 5;
        /// Occlusion may be tested in groups with nearby primitives.
        const ALLOW_APPROXIMATE_OCCLUSION     = 1 << 6;
        /// Occlusion bounds may cross the near plane.
        const IGNORE_NEAR_PLANE_INTERSECTION  = 1 << 7;
        /// Shadow fades out with projected size.
        const ALLOW_SHADOW_FADE               = 1 << 8;
        const ACCEPTS_LIGHTS                  = 1 << 9;
        const HIDDEN                          = 1 << 10;
    }
}

impl PrimitiveFlags {
    /// Flags of an ordinary dynamic shadow caster.
    #[must_use]
    pub fn dynamic_caster() -> Self {
        Self::CAST_SHADOW
            | Self::CAST_DYNAMIC_SHADOW
            | Self::ALLOW_SHADOW_FADE
            | Self::ACCEPTS_LIGHTS
    }

    /// Flags of static level geometry.
    #[must_use]
    pub fn static_caster() -> Self {
        Self::STATIC_SHADOWING
            | Self::CAST_SHADOW
            | Self::CAST_DYNAMIC_SHADOW
            | Self::CAST_STATIC_SHADOW
            | Self::ACCEPTS_LIGHTS
    }
}

bitflags! {
    /// How a primitive is relevant to a view.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PrimitiveRelevance: u32 {
        const OPAQUE      = 1 << 0;
        const TRANSLUCENT = 1 << 1;
        /// Drawn in the foreground depth group (weapons, UI models).
        const FOREGROUND  = 1 << 2;
        /// Drawn through static mesh draw lists.
        const STATIC      = 1 << 3;
        const DYNAMIC     = 1 << 4;
        /// Relevant only through its shadow.
        const SHADOW      = 1 << 5;
    }
}

/// Scene-unique id of a static mesh element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StaticMeshId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticMeshDesc {
    pub mesh: MeshHandle,
    pub lod_index: u8,
    pub min_draw_distance: f32,
    pub max_draw_distance: f32,
    pub cast_shadow: bool,
    /// Material alpha-tests; depth rendering needs the masked pixel shader.
    pub masked: bool,
    pub two_sided: bool,
}

impl StaticMeshDesc {
    #[must_use]
    pub fn new(mesh: MeshHandle) -> Self {
        Self {
            mesh,
            lod_index: 0,
            min_draw_distance: 0.0,
            max_draw_distance: f32::MAX.sqrt(),
            cast_shadow: true,
            masked: false,
            two_sided: false,
        }
    }
}

/// A static mesh element registered with the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticMesh {
    pub id: StaticMeshId,
    pub desc: StaticMeshDesc,
}

impl StaticMesh {
    /// Whether the element is drawn at `distance_sq` from the view.
    ///
    /// Minimum distances of LOD 0 are never scaled so the base LOD can't
    /// disappear when the global draw distance shrinks.
    #[must_use]
    pub fn in_draw_range(&self, distance_sq: f32, max_draw_distance_scale: f32) -> bool {
        let scale_sq = max_draw_distance_scale * max_draw_distance_scale;
        let min_sq = self.desc.min_draw_distance * self.desc.min_draw_distance
            * if self.desc.lod_index == 0 { 1.0 } else { scale_sq };
        let max_sq = self.desc.max_draw_distance * self.desc.max_draw_distance * scale_sq;
        distance_sq >= min_sq && distance_sq < max_sq
    }
}

// ============================================================================
// PrimitiveDesc
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveDesc {
    pub id: PrimitiveId,
    pub bounds: BoxSphereBounds,
    pub flags: PrimitiveFlags,
    pub relevance: PrimitiveRelevance,
    pub lighting_channels: LightingChannels,
    pub static_meshes: Vec<StaticMeshDesc>,
    /// Mesh drawn through the dynamic path when no static element applies.
    pub dynamic_mesh: Option<MeshHandle>,
}

impl PrimitiveDesc {
    /// A dynamic opaque caster drawn through `mesh`.
    #[must_use]
    pub fn dynamic(bounds: BoxSphereBounds, mesh: MeshHandle) -> Self {
        Self {
            id: PrimitiveId::next(),
            bounds,
            flags: PrimitiveFlags::dynamic_caster(),
            relevance: PrimitiveRelevance::OPAQUE | PrimitiveRelevance::DYNAMIC,
            lighting_channels: LightingChannels::default(),
            static_meshes: Vec::new(),
            dynamic_mesh: Some(mesh),
        }
    }

    /// A static opaque caster made of one static mesh element.
    #[must_use]
    pub fn static_mesh(bounds: BoxSphereBounds, mesh: MeshHandle) -> Self {
        Self {
            id: PrimitiveId::next(),
            bounds,
            flags: PrimitiveFlags::static_caster(),
            relevance: PrimitiveRelevance::OPAQUE | PrimitiveRelevance::STATIC,
            lighting_channels: LightingChannels::default(),
            static_meshes: vec![StaticMeshDesc::new(mesh)],
            dynamic_mesh: None,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: PrimitiveFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[must_use]
    pub fn with_relevance(mut self, relevance: PrimitiveRelevance) -> Self {
        self.relevance |= relevance;
        self
    }
}

// ============================================================================
// PrimitiveSceneInfo
// ============================================================================

/// Render-side primitive record.
#[derive(Debug, Clone)]
pub struct PrimitiveSceneInfo {
    pub desc: PrimitiveDesc,
    pub static_meshes: Vec<StaticMesh>,
    /// Last frame time the primitive was visible in any view.
    pub last_render_time: f32,
    /// Last frame time visibility flipped in either direction.
    pub last_visibility_change_time: f32,
    /// The dominant light that is allowed to shadow this primitive.
    pub brightest_dominant_light: Option<LightKey>,
    /// Lights restricted by an attached light environment.
    pub light_environment: Option<FxHashSet<LightId>>,
    pub interactions: Vec<LightKey>,
}

impl PrimitiveSceneInfo {
    #[must_use]
    pub fn new(desc: PrimitiveDesc, static_meshes: Vec<StaticMesh>) -> Self {
        Self {
            desc,
            static_meshes,
            last_render_time: f32::NEG_INFINITY,
            last_visibility_change_time: 0.0,
            brightest_dominant_light: None,
            light_environment: None,
            interactions: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> PrimitiveId {
        self.desc.id
    }

    #[inline]
    #[must_use]
    pub fn bounds(&self) -> &BoxSphereBounds {
        &self.desc.bounds
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> PrimitiveFlags {
        self.desc.flags
    }

    #[inline]
    #[must_use]
    pub fn has(&self, flags: PrimitiveFlags) -> bool {
        self.desc.flags.contains(flags)
    }

    /// Squared distance used to select LODs and draw ranges.
    #[inline]
    #[must_use]
    pub fn lod_distance_squared(&self, view_origin: Vec3) -> f32 {
        self.desc.bounds.origin.distance_squared(view_origin)
    }

    /// Whether `light` may interact with this primitive at all.
    #[must_use]
    pub fn accepts_light(&self, light: LightId) -> bool {
        self.light_environment
            .as_ref()
            .is_none_or(|environment| environment.contains(&light))
    }
}

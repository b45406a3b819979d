//! Projected Shadows
//!
//! A [`ProjectedShadow`] is one scheduled shadow map: its projection recipe,
//! its place in an atlas, the primitives it draws and the per-view alphas it
//! projects with.
//!
//! # Lifecycle
//!
//! ```text
//!   Planned ──► Allocated ──► DepthsRendered ──► Projected ──► Retired
//!                   │                               ▲
//!                   └──── depths cached (cache hit) ┘
//! ```
//!
//! # Matrices
//!
//! | Kind       | Depth pass (`subject_and_receiver`)     | Projection (`receiver`) |
//! |------------|-----------------------------------------|-------------------------|
//! | PreShadow  | pre-subject (fudged subject if directional) | subject             |
//! | all others | subject                                 | post-subject            |
//!
//! Matrices act on translated positions; the frustums stored here are
//! already moved back to world space.

use glam::{Mat4, Vec3, Vec4};
use smallvec::SmallVec;

use super::initializer::ProjectedShadowInitializer;
use super::texture_layout::LayoutRect;
use crate::math::bounds::{Aabb, BoxSphereBounds, Sphere};
use crate::math::frustum::ConvexVolume;
use crate::rhi::{MeshHandle, TextureHandle};
use crate::scene::primitive::StaticMeshId;
use crate::scene::view::ViewInfo;
use crate::scene::{LightId, LightKey, LightSceneInfo, PrimitiveId, PrimitiveKey};
use crate::settings::{SHADOW_BORDER, ShadowSettings};

/// What a shadow covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShadowKind {
    /// One dynamic subject casting onto everything behind it.
    PerObject,
    /// Static occluders casting onto one dynamic subject.
    PreShadow,
    /// One split of a directional light's view-dependent cascades.
    WholeSceneCascade { split: u32 },
    /// A spot light's whole cone.
    WholeScene,
    /// All six faces of a point light in one amplified pass.
    OnePassPoint,
    /// One face of a point light without amplification.
    CubeFace { face: u8 },
    /// Directional light shadow for a mirrored view.
    PlanarReflection,
}

impl ShadowKind {
    #[inline]
    #[must_use]
    pub fn is_whole_scene(self) -> bool {
        !matches!(self, Self::PerObject | Self::PreShadow)
    }

    #[inline]
    #[must_use]
    pub fn is_preshadow(self) -> bool {
        matches!(self, Self::PreShadow)
    }

    /// Renders into a cube map rather than a 2D atlas.
    #[inline]
    #[must_use]
    pub fn is_cube(self) -> bool {
        matches!(self, Self::OnePassPoint | Self::CubeFace { .. })
    }

    /// Projects only onto the view it was built for.
    #[inline]
    #[must_use]
    pub fn is_view_dependent(self) -> bool {
        matches!(self, Self::WholeSceneCascade { .. } | Self::PlanarReflection)
    }

    #[inline]
    #[must_use]
    pub fn split(self) -> Option<u32> {
        match self {
            Self::WholeSceneCascade { split } => Some(split),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShadowState {
    Planned,
    Allocated,
    DepthsRendered,
    Projected,
    Retired,
}

/// The texture a shadow renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtlasKind {
    Transient,
    /// Reserved for the first cascade of the primary directional light.
    Dominant,
    PreshadowCache,
    Cube,
}

/// Where an allocated shadow lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowTarget {
    pub atlas: AtlasKind,
    pub texture: TextureHandle,
    /// Allocated rectangle, border included.
    pub rect: LayoutRect,
    pub buffer_width: u32,
    pub buffer_height: u32,
}

/// One static mesh element drawn into a shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticMeshDraw {
    pub primitive: PrimitiveKey,
    pub id: StaticMeshId,
    pub mesh: MeshHandle,
    pub masked: bool,
    pub two_sided: bool,
}

/// One scheduled shadow.
#[derive(Debug, Clone)]
pub struct ProjectedShadow {
    /// Index in the frame's shadow list.
    pub id: usize,
    pub light: LightKey,
    pub light_id: LightId,
    pub light_direction: Vec3,
    pub light_origin: Vec3,
    pub subject: Option<(PrimitiveKey, PrimitiveId)>,
    pub kind: ShadowKind,
    pub initializer: ProjectedShadowInitializer,

    pub resolution_x: u32,
    pub resolution_y: u32,
    pub border: u32,
    pub max_screen_percent: f32,
    /// Indexed by view.
    pub fade_alphas: SmallVec<[f32; 2]>,
    /// Set for view-dependent shadows.
    pub dependent_view: Option<usize>,
    /// World-space bounds of a cascade split or planar reflection.
    pub whole_scene_bounds: Option<Sphere>,
    pub depth_bias: f32,

    pub state: ShadowState,
    pub target: Option<ShadowTarget>,
    /// Expanded subject bounds a cacheable preshadow was built for.
    pub cache_bounds: Option<BoxSphereBounds>,
    /// Depths in the preshadow cache are still valid from an earlier frame.
    pub depths_cached: bool,
    pub allocated_in_cache: bool,
    /// Per-object shadow projected onto its subject alone.
    pub self_shadow_only: bool,

    pub subject_primitives: Vec<PrimitiveKey>,
    pub receiver_primitives: Vec<PrimitiveKey>,
    pub static_mesh_draws: Vec<StaticMeshDraw>,
    pub dynamic_subjects: Vec<PrimitiveKey>,

    pub subject_and_receiver_matrix: Mat4,
    pub receiver_matrix: Mat4,
    pub inv_receiver_matrix: Mat4,
    pub inv_max_subject_depth: f32,
    pub pre_subject_frustum: ConvexVolume,
    pub subject_and_receiver_frustum: ConvexVolume,
    pub receiver_frustum: ConvexVolume,
    /// World to clip of each cube face, for one-pass point shadows.
    pub one_pass_view_projections: Option<[Mat4; 6]>,
}

impl ProjectedShadow {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        light_key: LightKey,
        light: &LightSceneInfo,
        subject: Option<(PrimitiveKey, PrimitiveId)>,
        kind: ShadowKind,
        initializer: ProjectedShadowInitializer,
        resolution_x: u32,
        resolution_y: u32,
        fade_alphas: SmallVec<[f32; 2]>,
    ) -> Self {
        let preshadow = kind.is_preshadow();
        let subject_and_receiver_matrix = match (preshadow, initializer.directional) {
            (true, true) => initializer.subject_matrix_fudged,
            (true, false) => initializer.pre_subject_matrix,
            (false, _) => initializer.subject_matrix,
        };
        let receiver_matrix = if preshadow {
            initializer.subject_matrix
        } else {
            initializer.post_subject_matrix
        };
        let max_subject_depth = if preshadow && !initializer.directional {
            initializer.max_pre_subject_depth
        } else {
            initializer.max_subject_depth
        };

        let to_world = -initializer.pre_shadow_translation;
        let directional_whole_scene = initializer.directional && kind.is_whole_scene();
        let pre_subject_frustum =
            ConvexVolume::from_matrix(&initializer.pre_subject_matrix, false).translated(to_world);
        let subject_and_receiver_frustum =
            ConvexVolume::from_matrix(&subject_and_receiver_matrix, !directional_whole_scene)
                .translated(to_world);
        let receiver_frustum = ConvexVolume::from_matrix(&receiver_matrix, true).translated(to_world);

        let one_pass_view_projections = matches!(kind, ShadowKind::OnePassPoint).then(|| {
            std::array::from_fn(|face| {
                crate::math::transforms::cube_face_view_projection(
                    light.desc.position,
                    face,
                    0.1,
                    light.desc.radius,
                )
            })
        });

        Self {
            id: 0,
            light: light_key,
            light_id: light.id(),
            light_direction: light.desc.direction,
            light_origin: light.desc.position,
            subject,
            kind,
            resolution_x,
            resolution_y,
            border: if kind.is_cube() {
                0
            } else {
                SHADOW_BORDER
            },
            max_screen_percent: 0.0,
            fade_alphas,
            dependent_view: None,
            whole_scene_bounds: None,
            depth_bias: 0.0,
            state: ShadowState::Planned,
            target: None,
            cache_bounds: None,
            depths_cached: false,
            allocated_in_cache: false,
            self_shadow_only: false,
            subject_primitives: Vec::new(),
            receiver_primitives: Vec::new(),
            static_mesh_draws: Vec::new(),
            dynamic_subjects: Vec::new(),
            inv_receiver_matrix: receiver_matrix.inverse(),
            subject_and_receiver_matrix,
            receiver_matrix,
            inv_max_subject_depth: 1.0 / max_subject_depth.max(f32::EPSILON),
            pre_subject_frustum,
            subject_and_receiver_frustum,
            receiver_frustum,
            one_pass_view_projections,
            initializer,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_preshadow(&self) -> bool {
        self.kind.is_preshadow()
    }

    #[inline]
    #[must_use]
    pub fn is_whole_scene(&self) -> bool {
        self.kind.is_whole_scene()
    }

    #[inline]
    #[must_use]
    pub fn subject_id(&self) -> Option<PrimitiveId> {
        self.subject.map(|(_, id)| id)
    }

    /// Allocated size including the border on both sides.
    #[inline]
    #[must_use]
    pub fn allocation_size(&self) -> (u32, u32) {
        (
            self.resolution_x + self.border * 2,
            self.resolution_y + self.border * 2,
        )
    }

    #[inline]
    #[must_use]
    pub fn area(&self) -> u64 {
        u64::from(self.resolution_x) * u64::from(self.resolution_y)
    }

    #[inline]
    #[must_use]
    pub fn fade_alpha(&self, view: usize) -> f32 {
        self.fade_alphas.get(view).copied().unwrap_or(0.0)
    }

    /// World position to depth-pass clip space.
    #[must_use]
    pub fn world_to_shadow(&self) -> Mat4 {
        self.subject_and_receiver_matrix
            * Mat4::from_translation(self.initializer.pre_shadow_translation)
    }

    /// World position to projection clip space.
    #[must_use]
    pub fn world_to_receiver(&self) -> Mat4 {
        self.receiver_matrix * Mat4::from_translation(self.initializer.pre_shadow_translation)
    }

    /// Maps receiver clip space to atlas UV and normalised depth.
    ///
    /// ```text
    ///   u = (x / w) * 0.5 * res_x / buf_w + (rect.x + border + 0.5 * res_x) / buf_w
    ///   v = (y / w) * -0.5 * res_y / buf_h + (rect.y + border + 0.5 * res_y) / buf_h
    ///   d = (z / w) / max_subject_depth
    /// ```
    #[must_use]
    pub fn atlas_scale_bias(&self) -> Mat4 {
        let (x, y, buf_w, buf_h) = match self.target {
            Some(t) => (
                t.rect.x as f32,
                t.rect.y as f32,
                t.buffer_width.max(1) as f32,
                t.buffer_height.max(1) as f32,
            ),
            None => (
                0.0,
                0.0,
                self.allocation_size().0 as f32,
                self.allocation_size().1 as f32,
            ),
        };
        let border = self.border as f32;
        let half_x = 0.5 * self.resolution_x as f32;
        let half_y = 0.5 * self.resolution_y as f32;
        Mat4::from_cols(
            Vec4::new(half_x / buf_w, 0.0, 0.0, 0.0),
            Vec4::new(0.0, -half_y / buf_h, 0.0, 0.0),
            Vec4::new(0.0, 0.0, self.inv_max_subject_depth, 0.0),
            Vec4::new(
                (x + border + half_x) / buf_w,
                (y + border + half_y) / buf_h,
                0.0,
                1.0,
            ),
        )
    }

    /// Screen clip space of `view` to atlas UV and depth (divide by `w`).
    #[must_use]
    pub fn screen_to_shadow(&self, view: &ViewInfo) -> Mat4 {
        self.atlas_scale_bias() * self.world_to_receiver() * view.inv_view_projection
    }

    /// Inverse of [`screen_to_shadow`](Self::screen_to_shadow), built from
    /// the inverses of each stage.
    #[must_use]
    pub fn shadow_to_screen(&self, view: &ViewInfo) -> Mat4 {
        view.view_projection
            * Mat4::from_translation(-self.initializer.pre_shadow_translation)
            * self.inv_receiver_matrix
            * self.atlas_scale_bias().inverse()
    }

    /// World-space corners of the depth-pass frustum, indexed like
    /// [`Aabb::corners`].
    #[must_use]
    pub fn frustum_corners(&self) -> [Vec3; 8] {
        let inv = self.world_to_shadow().inverse();
        let clip = Aabb::new(Vec3::new(-1.0, -1.0, 0.0), Vec3::ONE);
        clip.corners().map(|c| inv.project_point3(c))
    }

    /// Box used for the shadow's occlusion query: the receiver frustum
    /// clipped to the subject depth range.
    #[must_use]
    pub fn occlusion_bounds(&self) -> Aabb {
        let inv = self.world_to_receiver().inverse();
        let clip = Aabb::new(Vec3::new(-1.0, -1.0, 0.0), Vec3::ONE);
        let mut out = Aabb::EMPTY;
        for corner in clip.corners() {
            let p = inv.project_point3(corner);
            if p.is_finite() {
                out.expand_to_include(p);
            }
        }
        out
    }

    /// Depth bias for the depth pass.
    ///
    /// Scaled inversely with resolution so that a texel covers the same
    /// world distance; none for preshadows, less for whole-scene shadows and
    /// growing with the split index for cascades.
    pub fn update_depth_bias(&mut self, light: &LightSceneInfo, settings: &ShadowSettings) {
        if self.is_preshadow() {
            self.depth_bias = 0.0;
            return;
        }
        let resolution = self.resolution_x.max(self.resolution_y).max(1) as f32;
        let mut bias = settings.shadow_depth_bias * 512.0 / resolution + light.desc.depth_bias;
        if self.is_whole_scene() {
            bias *= 0.6;
        }
        if let Some(split) = self.kind.split().filter(|&s| s > 0) {
            bias *= split as f32 * settings.csm_split_depth_bias_scale + 1.0;
        }
        self.depth_bias = bias;
    }

    /// Ordering used for allocation and rendering: the primary cascade,
    /// then larger shadows first, then stable ids.
    #[must_use]
    pub fn sort_key(&self) -> (bool, std::cmp::Reverse<u64>, LightId, Option<PrimitiveId>, u32) {
        let primary = matches!(self.kind, ShadowKind::WholeSceneCascade { split: 0 });
        (
            !primary,
            std::cmp::Reverse(self.area()),
            self.light_id,
            self.subject_id(),
            self.kind.split().unwrap_or(0),
        )
    }
}

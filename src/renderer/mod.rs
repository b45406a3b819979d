//! Renderer
//!
//! [`Renderer::render_frame`] drives one frame of the shadow pipeline:
//!
//! 1. Primitive visibility per view (frustum, then occlusion history)
//! 2. [`init_dynamic_shadows`]: plan every shadow and its fade
//! 3. Shadow visibility per view
//! 4. [`gather_shadow_primitives`]: subjects and receivers
//! 5. [`update_preshadow_cache`]: reuse or pack cacheable preshadows
//! 6. Per light: pack atlases pass by pass, render depths, project
//! 7. Submit occlusion queries for the next frame
//!
//! Everything the frame decided is returned in a [`FrameReport`].

pub mod command;
pub mod occlusion;
pub mod sample_tables;
pub mod shadows;

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use self::occlusion::{OcclusionKey, OcclusionStats, OcclusionTest, ViewOcclusionState};
use self::shadows::depth::render_shadow_depths;
use self::shadows::pcf::RotationTexture;
use self::shadows::preshadow_cache::PreshadowCacheStats;
use self::shadows::projection::{ProjectionResources, project_shadow};
use self::shadows::{
    AtlasKind, CubeShadowAtlas, GatherStats, PreshadowCache, ProjectedShadow, SetupContext,
    ShadowAtlas, ShadowFrameStats, ShadowKind, ShadowState, compute_shadow_visibility,
    gather_shadow_primitives, init_dynamic_shadows, update_preshadow_cache,
};
use crate::errors::Result;
use crate::math::bounds::BoxSphereBounds;
use crate::rhi::RenderDevice;
use crate::scene::{
    LightId, PrimitiveFlags, PrimitiveKey, PrimitiveRelevance, Scene, ShowFlags, ViewDesc,
    ViewInfo, ViewStateId,
};
use crate::settings::{GpuCapabilities, ShadowSettings};

// ============================================================================
// WarnOnce
// ============================================================================

/// Logs each warning key at most once until [`reset`](Self::reset).
///
/// The renderer resets it at frame start, so a recurring degradation is
/// reported once per frame instead of once per shadow.
#[derive(Debug, Default)]
pub struct WarnOnce {
    seen: FxHashSet<&'static str>,
}

impl WarnOnce {
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Returns whether the warning was emitted.
    pub fn warn(&mut self, key: &'static str, message: fmt::Arguments<'_>) -> bool {
        if self.seen.insert(key) {
            log::warn!("{message}");
            true
        } else {
            false
        }
    }
}

// ============================================================================
// FrameReport
// ============================================================================

/// What one call to [`Renderer::render_frame`] did.
#[derive(Debug)]
pub struct FrameReport {
    pub frame: u64,
    pub stats: ShadowFrameStats,
    pub gather: GatherStats,
    /// Occlusion counters of each view that carries a view state, in view
    /// order.
    pub occlusion: Vec<OcclusionStats>,
    pub cache: PreshadowCacheStats,
    /// Every planned shadow, indexed by its id.
    pub shadows: Vec<ProjectedShadow>,
    pub views: Vec<ViewInfo>,
}

impl FrameReport {
    /// Shadows that reached the projection stage.
    pub fn projected(&self) -> impl Iterator<Item = &ProjectedShadow> {
        self.shadows
            .iter()
            .filter(|s| s.state == ShadowState::Projected)
    }

    pub fn shadows_of_kind(&self, kind: ShadowKind) -> impl Iterator<Item = &ProjectedShadow> {
        self.shadows.iter().filter(move |s| s.kind == kind)
    }
}

// ============================================================================
// Renderer
// ============================================================================

/// Render-thread owner of every cross-frame resource of the shadow pipeline.
#[derive(Debug)]
pub struct Renderer {
    settings: Arc<ShadowSettings>,
    caps: GpuCapabilities,
    frame: u64,
    last_frame_time: Option<f32>,

    occlusion: FxHashMap<ViewStateId, ViewOcclusionState>,
    preshadow_cache: PreshadowCache,
    transient_atlas: ShadowAtlas,
    dominant_atlas: ShadowAtlas,
    cube_atlas: CubeShadowAtlas,
    cube_resolution: u32,
    projection: ProjectionResources,

    warnings: WarnOnce,
}

impl Renderer {
    pub fn new(device: &mut dyn RenderDevice, settings: Arc<ShadowSettings>) -> Result<Self> {
        let caps = device.capabilities();
        let settings = fit_to_device(settings, &caps)?;
        let rotation = RotationTexture::default();
        let projection = ProjectionResources::new(device, &rotation)?;
        log::info!(
            "Shadow renderer created: buffer {}, hardware PCF {}, fetch4 {}, GPUs {}",
            settings.shadow_depth_buffer_size,
            caps.hardware_pcf,
            caps.fetch4,
            caps.gpu_count
        );
        Ok(Self {
            preshadow_cache: PreshadowCache::new(settings.preshadow_cache_size, settings.atlas_alignment),
            transient_atlas: Self::transient_atlas(&settings),
            dominant_atlas: Self::dominant_atlas(&settings),
            cube_atlas: CubeShadowAtlas::new(settings.cube_shadow_resolution, CubeShadowAtlas::DEFAULT_CAPACITY),
            cube_resolution: settings.cube_shadow_resolution,
            settings,
            caps,
            frame: 0,
            last_frame_time: None,
            occlusion: FxHashMap::default(),
            projection,
            warnings: WarnOnce::default(),
        })
    }

    fn transient_atlas(settings: &ShadowSettings) -> ShadowAtlas {
        ShadowAtlas::new(
            AtlasKind::Transient,
            "Shadow Depth Atlas",
            settings.shadow_depth_buffer_size,
            settings.atlas_alignment,
        )
    }

    fn dominant_atlas(settings: &ShadowSettings) -> ShadowAtlas {
        ShadowAtlas::new(
            AtlasKind::Dominant,
            "Dominant Shadow Atlas",
            settings.dominant_shadow_buffer_size,
            settings.atlas_alignment,
        )
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<ShadowSettings> {
        &self.settings
    }

    #[must_use]
    pub fn capabilities(&self) -> GpuCapabilities {
        self.caps
    }

    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[must_use]
    pub fn preshadow_cache(&self) -> &PreshadowCache {
        &self.preshadow_cache
    }

    #[must_use]
    pub fn occlusion_state(&self, state: ViewStateId) -> Option<&ViewOcclusionState> {
        self.occlusion.get(&state)
    }

    /// Swaps the settings snapshot used from the next frame on.
    pub fn set_settings(&mut self, settings: Arc<ShadowSettings>) -> Result<()> {
        self.settings = fit_to_device(settings, &self.caps)?;
        Ok(())
    }

    /// Destroys every device resource the renderer created.
    pub fn release(self, device: &mut dyn RenderDevice) {
        let Self {
            mut occlusion,
            mut preshadow_cache,
            mut transient_atlas,
            mut dominant_atlas,
            mut cube_atlas,
            projection,
            ..
        } = self;
        for state in occlusion.values_mut() {
            state.release(device);
        }
        preshadow_cache.release_all(device);
        transient_atlas.release(device);
        dominant_atlas.release(device);
        cube_atlas.release(device);
        projection.release(device);
    }

    /// Recreates resources whose size no longer matches the settings.
    fn sync_resources(&mut self, device: &mut dyn RenderDevice) {
        let settings = Arc::clone(&self.settings);
        if self.transient_atlas.size() != settings.shadow_depth_buffer_size {
            self.transient_atlas.release(device);
            self.transient_atlas = Self::transient_atlas(&settings);
        }
        if self.dominant_atlas.size() != settings.dominant_shadow_buffer_size {
            self.dominant_atlas.release(device);
            self.dominant_atlas = Self::dominant_atlas(&settings);
        }
        if self.preshadow_cache.size() != settings.preshadow_cache_size {
            self.preshadow_cache.release_all(device);
            self.preshadow_cache = PreshadowCache::new(settings.preshadow_cache_size, settings.atlas_alignment);
        }
        if self.cube_resolution != settings.cube_shadow_resolution {
            self.cube_atlas.release(device);
            self.cube_atlas = CubeShadowAtlas::new(settings.cube_shadow_resolution, CubeShadowAtlas::DEFAULT_CAPACITY);
            self.cube_resolution = settings.cube_shadow_resolution;
        }
    }

    /// Renders the shadows of one frame.
    ///
    /// `now` is in seconds and must not decrease between calls.
    pub fn render_frame(
        &mut self,
        device: &mut dyn RenderDevice,
        scene: &mut Scene,
        views: &[ViewDesc],
        now: f32,
    ) -> Result<FrameReport> {
        self.warnings.reset();
        self.frame += 1;
        self.sync_resources(device);
        let settings = Arc::clone(&self.settings);

        let (removed_primitives, removed_lights) = scene.take_removed();
        for &primitive in &removed_primitives {
            self.preshadow_cache.release_primitive(primitive);
            for state in self.occlusion.values_mut() {
                state.forget_primitive(primitive);
            }
        }
        for &light in &removed_lights {
            self.preshadow_cache.release_light(light);
            for state in self.occlusion.values_mut() {
                state.forget_light(light);
            }
        }

        let mut view_infos = views
            .iter()
            .enumerate()
            .map(|(index, desc)| ViewInfo::new(index, desc.clone()))
            .collect::<Result<Vec<_>>>()?;
        for state in view_infos.iter().filter_map(|v| v.desc.state) {
            let buffered = self.caps.occlusion_buffered_frames();
            let pool = settings.occlusion_query_pool_size;
            self.occlusion
                .entry(state)
                .or_insert_with(|| ViewOcclusionState::new(buffered, pool))
                .begin_frame(self.frame);
        }

        self.compute_primitive_visibility(device, scene, &mut view_infos, now, &settings);

        let mut frame = init_dynamic_shadows(
            scene,
            &mut self.preshadow_cache,
            &SetupContext {
                views: &view_infos,
                settings: &settings,
                caps: self.caps,
                now,
            },
        );

        {
            let view_params: Vec<_> = view_infos
                .iter()
                .map(|v| (v.desc.state, v.desc.origin, v.desc.near_clip, view_pixels(&v.desc)))
                .collect();
            let occlusion = &mut self.occlusion;
            compute_shadow_visibility(&frame.shadows, &mut view_infos, scene, |view, shadow| {
                let (Some(state), origin, near_clip, pixels) = view_params[view] else {
                    return false;
                };
                let (Some(state), Some(primitive)) = (occlusion.get_mut(&state), shadow.subject_id()) else {
                    return false;
                };
                let test = OcclusionTest {
                    key: OcclusionKey::Shadow {
                        primitive,
                        light: shadow.light_id,
                        preshadow: shadow.is_preshadow(),
                    },
                    bounds: BoxSphereBounds::from_box(&shadow.occlusion_bounds()),
                    allow_grouping: false,
                    ignore_near_plane: true,
                };
                state
                    .update_and_query(device, &test, origin, near_clip, pixels, now, &settings)
                    .occluded
            });
        }

        let gather = gather_shadow_primitives(&mut frame.shadows, scene, &view_infos, &settings, self.caps);

        let cache_failures = update_preshadow_cache(
            &mut self.preshadow_cache,
            device,
            &mut frame.shadows,
            &frame.referenced_preshadows,
        )?;
        if cache_failures > 0 {
            self.warnings.warn(
                "preshadow_cache_full",
                format_args!("{cache_failures} preshadows did not fit the preshadow cache"),
            );
        }

        self.render_lights(device, scene, &view_infos, &mut frame.shadows, &mut frame.stats)?;

        for state in view_infos.iter().filter_map(|v| v.desc.state) {
            if let Some(occlusion) = self.occlusion.get_mut(&state) {
                occlusion.submit_queries(device);
                occlusion.evict_stale(now, settings.occlusion_history_ttl);
            }
        }
        let occlusion = view_infos
            .iter()
            .filter_map(|v| v.desc.state)
            .filter_map(|state| self.occlusion.get(&state).map(ViewOcclusionState::stats))
            .collect();

        self.last_frame_time = Some(now);
        log::debug!(
            "Frame {}: {} shadows, {} depth draws, {} passes",
            self.frame,
            frame.shadows.len(),
            frame.stats.depth_draws,
            frame.stats.atlas_passes
        );

        Ok(FrameReport {
            frame: self.frame,
            stats: frame.stats,
            gather,
            occlusion,
            cache: self.preshadow_cache.take_stats(),
            shadows: frame.shadows,
            views: view_infos,
        })
    }

    /// Frustum and occlusion culling of every primitive in every view.
    fn compute_primitive_visibility(
        &mut self,
        device: &mut dyn RenderDevice,
        scene: &mut Scene,
        views: &mut [ViewInfo],
        now: f32,
        settings: &ShadowSettings,
    ) {
        let mut visible_anywhere: FxHashSet<PrimitiveKey> = FxHashSet::default();

        for view in views.iter_mut() {
            let mut candidates = Vec::new();
            scene.octree().traverse(
                |node| view.frustum.intersects_bounds(node),
                |element| {
                    if view.frustum.intersects_bounds(&element.bounds) {
                        candidates.push(element.primitive);
                    }
                },
            );
            candidates.sort_unstable_by_key(|&key| scene.primitive(key).map(|p| p.id()));

            let pixels = view_pixels(&view.desc);
            let mut occlusion = view.desc.state.and_then(|state| self.occlusion.get_mut(&state));

            for key in candidates {
                let Some(primitive) = scene.primitive(key) else {
                    continue;
                };
                if primitive.has(PrimitiveFlags::HIDDEN) {
                    continue;
                }
                if let Some(state) = occlusion.as_deref_mut() {
                    let test = OcclusionTest {
                        key: OcclusionKey::Primitive(primitive.id()),
                        bounds: *primitive.bounds(),
                        allow_grouping: primitive.has(PrimitiveFlags::ALLOW_APPROXIMATE_OCCLUSION),
                        ignore_near_plane: primitive.has(PrimitiveFlags::IGNORE_NEAR_PLANE_INTERSECTION),
                    };
                    let result = state.update_and_query(
                        device,
                        &test,
                        view.desc.origin,
                        view.desc.near_clip,
                        pixels,
                        now,
                        settings,
                    );
                    if result.occluded {
                        continue;
                    }
                }

                let relevance = if primitive.desc.relevance.is_empty() {
                    PrimitiveRelevance::OPAQUE
                } else {
                    primitive.desc.relevance
                };
                view.primitive_visibility.insert(key);
                view.primitive_relevance.insert(key, relevance);
                visible_anywhere.insert(key);

                let factor = view.desc.lod_distance_factor;
                let distance_sq = primitive.lod_distance_squared(view.desc.origin) * factor * factor;
                for mesh in &primitive.static_meshes {
                    if mesh.in_draw_range(distance_sq, settings.max_draw_distance_scale) {
                        view.static_mesh_visibility.insert(mesh.id);
                    }
                }
                if primitive.desc.dynamic_mesh.is_some() {
                    view.visible_dynamic_primitives.push(key);
                }
            }
        }

        let keys: Vec<PrimitiveKey> = scene.primitives().map(|(key, _)| key).collect();
        let last_frame_time = self.last_frame_time;
        for key in keys {
            let Some(primitive) = scene.primitive_mut(key) else {
                continue;
            };
            let was_visible = last_frame_time.is_some_and(|t| primitive.last_render_time >= t);
            let is_visible = visible_anywhere.contains(&key);
            if was_visible != is_visible {
                primitive.last_visibility_change_time = now;
            }
            if is_visible {
                primitive.last_render_time = now;
            }
        }
    }

    /// Allocates, renders and projects the shadows of every light.
    fn render_lights(
        &mut self,
        device: &mut dyn RenderDevice,
        scene: &Scene,
        views: &[ViewInfo],
        shadows: &mut [ProjectedShadow],
        stats: &mut ShadowFrameStats,
    ) -> Result<()> {
        self.cube_atlas.begin_frame();

        let mut lights: Vec<LightId> = shadows.iter().map(|s| s.light_id).collect();
        lights.sort_unstable();
        lights.dedup();

        for light in lights {
            let of_light: Vec<usize> = shadows
                .iter()
                .filter(|s| s.light_id == light)
                .map(|s| s.id)
                .collect();

            // Targets assigned by the preshadow cache.
            let cached: Vec<usize> = of_light
                .iter()
                .copied()
                .filter(|&i| shadows[i].target.is_some())
                .collect();
            if !cached.is_empty() {
                self.render_and_project(device, scene, views, shadows, &cached, stats);
            }

            let cube_candidates: Vec<usize> = of_light
                .iter()
                .copied()
                .filter(|&i| shadows[i].kind.is_cube())
                .collect();
            let mut cubes = Vec::new();
            for i in cube_candidates {
                match self.cube_atlas.allocate_shadow(device, &mut shadows[i]) {
                    Ok(()) => {
                        shadows[i].state = ShadowState::Allocated;
                        cubes.push(i);
                    }
                    Err(err) => {
                        self.warnings.warn(
                            "cube_atlas_full",
                            format_args!("Point light {} lost its shadow: {err}", light.0),
                        );
                    }
                }
            }
            if !cubes.is_empty() {
                self.render_and_project(device, scene, views, shadows, &cubes, stats);
            }

            let mut remaining: Vec<usize> = of_light
                .iter()
                .copied()
                .filter(|&i| shadows[i].target.is_none() && !shadows[i].kind.is_cube())
                .collect();
            while !remaining.is_empty() {
                self.transient_atlas.reset();
                self.dominant_atlas.reset();

                let mut placed = Vec::new();
                let mut deferred = Vec::new();
                for i in remaining {
                    let shadow = &mut shadows[i];
                    let fitted = if uses_dominant_atlas(shadow.kind) {
                        self.dominant_atlas.allocate(device, shadow)?
                            || self.transient_atlas.allocate(device, shadow)?
                    } else {
                        self.transient_atlas.allocate(device, shadow)?
                    };
                    if fitted {
                        shadow.state = ShadowState::Allocated;
                        placed.push(i);
                    } else {
                        deferred.push(i);
                    }
                }

                if placed.is_empty() {
                    stats.aborted_lights += 1;
                    self.warnings.warn(
                        "shadow_atlas_full",
                        format_args!(
                            "Light {}: {} shadows do not fit an empty {}x{} atlas",
                            light.0,
                            deferred.len(),
                            self.transient_atlas.size(),
                            self.transient_atlas.size()
                        ),
                    );
                    break;
                }
                self.transient_atlas.verify()?;
                self.dominant_atlas.verify()?;
                stats.atlas_passes += 1;
                self.render_and_project(device, scene, views, shadows, &placed, stats);
                remaining = deferred;
            }
        }
        Ok(())
    }

    fn render_and_project(
        &mut self,
        device: &mut dyn RenderDevice,
        scene: &Scene,
        views: &[ViewInfo],
        shadows: &mut [ProjectedShadow],
        indices: &[usize],
        stats: &mut ShadowFrameStats,
    ) {
        for &i in indices {
            let shadow = &mut shadows[i];
            let cached = shadow.depths_cached;
            let depth = render_shadow_depths(device, shadow, scene);
            stats.depth_draws += depth.draws;
            if shadow.allocated_in_cache && !cached {
                if let Some(primitive) = shadow.subject_id() {
                    self.preshadow_cache.mark_rendered(&(primitive, shadow.light_id));
                }
            }
        }
        for view in views {
            if !view.desc.show_flags.contains(ShowFlags::SHADOWS) {
                continue;
            }
            for &i in indices {
                project_shadow(
                    device,
                    &self.projection,
                    &mut shadows[i],
                    view,
                    scene,
                    &self.settings,
                    &self.caps,
                );
            }
        }
    }
}

/// Caps texture sizes at the device limit, then validates.
fn fit_to_device(settings: Arc<ShadowSettings>, caps: &GpuCapabilities) -> Result<Arc<ShadowSettings>> {
    let settings = match settings.clamped_to_device(caps) {
        Some(clamped) => {
            log::warn!(
                "Shadow texture sizes clamped to the device limit of {}",
                caps.max_texture_size
            );
            Arc::new(clamped)
        }
        None => settings,
    };
    settings.validate()?;
    Ok(settings)
}

fn uses_dominant_atlas(kind: ShadowKind) -> bool {
    matches!(
        kind,
        ShadowKind::WholeSceneCascade { split: 0 } | ShadowKind::WholeScene
    )
}

fn view_pixels(desc: &ViewDesc) -> u64 {
    u64::from(desc.size.x) * u64::from(desc.size.y)
}

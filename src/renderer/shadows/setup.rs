//! Shadow Setup
//!
//! The per-frame planner. Walks every shadow-casting light in id order and
//! decides which [`ProjectedShadow`]s the frame needs.
//!
//! # Whole-scene shadows
//!
//! | Light                               | Emitted                                   |
//! |-------------------------------------|-------------------------------------------|
//! | Directional, whole-scene            | one cascade per split of view 0           |
//! | Directional, view with mirror plane | one planar reflection shadow for that view|
//! | Spot, whole-scene                   | one perspective shadow over the cone      |
//! | Point, whole-scene, amplification   | one cube shadow rendered in a single pass |
//! | Point, whole-scene, otherwise       | six cube face shadows                     |
//!
//! # Per-interaction shadows
//!
//! For each light/primitive interaction with a shadow:
//!
//! 1. Reject lights that cast nothing, dominant lights that are not the
//!    primitive's brightest, and primitives hidden in every view (unless a
//!    hysteresis fade is still running).
//! 2. Size the shadow from the projected screen radius in every view and
//!    fade it by resolution and hysteresis.
//! 3. Emit a per-object shadow for opaque subjects not already covered by a
//!    whole-scene shadow.
//! 4. Emit a preshadow when static occluders may shadow the dynamic subject,
//!    unless a cascade already covers it. Preshadows are looked up in the
//!    preshadow cache first.
//!
//! The resulting list is sorted by [`ProjectedShadow::sort_key`] and ids are
//! assigned in that order, so identical inputs give identical plans.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use super::cascades::{CascadeSplit, MAX_CASCADES, slice_bounding_sphere, view_cascades};
use super::fade::{
    HysteresisParams, HysteresisState, MIN_FADE_ALPHA, hysteresis_fade_alpha, resolution_fade_alpha,
};
use super::preshadow_cache::{PreshadowCache, PreshadowKey};
use super::initializer::ProjectedShadowInitializer;
use super::projected::{AtlasKind, ProjectedShadow, ShadowKind, ShadowState, ShadowTarget};
use crate::math::bounds::{BoxSphereBounds, Sphere};
use crate::math::transforms::floor_pow2;
use crate::scene::view::ViewInfo;
use crate::scene::{
    LightFlags, LightId, LightKey, LightSceneInfo, LightType, PrimitiveFlags, PrimitiveId,
    PrimitiveKey, PrimitiveRelevance, PrimitiveSceneInfo, Scene,
};
use crate::settings::{GpuCapabilities, SHADOW_BORDER, ShadowSettings};

/// Per-frame counters of the shadow pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowFrameStats {
    pub per_object: usize,
    pub preshadows: usize,
    pub cascades: usize,
    pub whole_scene: usize,
    pub cube: usize,
    pub planar_reflections: usize,
    /// Interactions dropped because every fade alpha was negligible.
    pub culled_by_fade: usize,
    /// Preshadows dropped in favour of a cascade.
    pub culled_by_cascade: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub depth_draws: usize,
    pub atlas_passes: usize,
    /// Lights whose shadows did not fit even in an empty atlas.
    pub aborted_lights: usize,
}

/// The frame's shadow plan.
#[derive(Debug, Default)]
pub struct ShadowFrame {
    pub shadows: Vec<ProjectedShadow>,
    /// Preshadow cache keys requested this frame, hit or not.
    pub referenced_preshadows: FxHashSet<PreshadowKey>,
    pub stats: ShadowFrameStats,
}

/// Read-only inputs of setup.
#[derive(Debug, Clone, Copy)]
pub struct SetupContext<'a> {
    pub views: &'a [ViewInfo],
    pub settings: &'a ShadowSettings,
    pub caps: GpuCapabilities,
    /// Seconds since start, used by hysteresis fades.
    pub now: f32,
}

/// Resolution limits of one light.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResolutionLimits {
    min: u32,
    max: u32,
    fade: u32,
}

impl ResolutionLimits {
    fn for_light(light: &LightSceneInfo, settings: &ShadowSettings) -> Self {
        let buffer = settings.shadow_depth_buffer_size.saturating_sub(2 * SHADOW_BORDER);
        let override_or = |value: u32, default: u32| if value > 0 { value } else { default };
        let max = override_or(light.desc.max_shadow_resolution, settings.max_shadow_resolution)
            .saturating_sub(2 * SHADOW_BORDER)
            .min(buffer)
            .max(1);
        let min = override_or(light.desc.min_shadow_resolution, settings.min_shadow_resolution).min(buffer);
        let fade = override_or(light.desc.shadow_fade_resolution, settings.shadow_fade_resolution);
        Self { min, max, fade }
    }
}

#[inline]
fn ceil_log2(value: u32) -> u32 {
    if value <= 1 { 0 } else { 32 - (value - 1).leading_zeros() }
}

/// Power-of-two edge for a desired resolution: `max` once the desire
/// reaches it, otherwise the power of two below the desire's ceiling.
#[must_use]
pub fn shadow_size(desired: u32, max: u32) -> u32 {
    if desired >= max {
        max.max(1)
    } else {
        1 << ceil_log2(desired.max(1)).saturating_sub(1)
    }
}

/// `trunc(screen radius * texels per pixel)` in each view.
fn unclamped_resolutions(views: &[ViewInfo], origin: glam::Vec3, radius: f32, texels_per_pixel: f32) -> SmallVec<[u32; 2]> {
    views
        .iter()
        .map(|view| (view.screen_radius(origin, radius) * texels_per_pixel).max(0.0) as u32)
        .collect()
}

fn max_screen_percent(views: &[ViewInfo], origin: glam::Vec3, radius: f32) -> f32 {
    views
        .iter()
        .map(|view| view.screen_percent(origin, radius))
        .fold(0.0, f32::max)
}

fn max_alpha(alphas: &[f32]) -> f32 {
    alphas.iter().copied().fold(0.0, f32::max)
}

/// Plans every shadow of the frame.
///
/// Hysteresis state of the interactions is advanced in place; the
/// preshadow cache is only read (its statistics are updated).
pub fn init_dynamic_shadows(scene: &mut Scene, cache: &mut PreshadowCache, ctx: &SetupContext<'_>) -> ShadowFrame {
    let mut planner = ShadowPlanner::new(ctx);

    let mut lights: Vec<(LightId, LightKey)> =
        scene.lights().map(|(key, light)| (light.id(), key)).collect();
    lights.sort_unstable();

    let mut hysteresis_updates = Vec::new();
    for (_, light_key) in lights {
        let Some(light) = scene.light(light_key) else {
            continue;
        };
        if !light.casts_shadows() {
            continue;
        }
        planner.plan_whole_scene(light_key, light);

        for &primitive_key in &light.interactions {
            let (Some(primitive), Some(interaction)) = (
                scene.primitive(primitive_key),
                scene.interaction(light_key, primitive_key),
            ) else {
                continue;
            };
            if !interaction.has_shadow {
                continue;
            }
            let state = HysteresisState {
                start_fade_in: interaction.mod_shadow_start_fade_in,
                start_fade_out: interaction.mod_shadow_start_fade_out,
            };
            if let Some(state) =
                planner.plan_interaction(cache, light_key, light, primitive_key, primitive, interaction.is_dynamic, state)
            {
                hysteresis_updates.push((light_key, primitive_key, state));
            }
        }
    }

    for (light, primitive, state) in hysteresis_updates {
        if let Some(interaction) = scene.interaction_mut(light, primitive) {
            interaction.mod_shadow_start_fade_in = state.start_fade_in;
            interaction.mod_shadow_start_fade_out = state.start_fade_out;
        }
    }

    planner.finish()
}

struct ShadowPlanner<'a> {
    ctx: &'a SetupContext<'a>,
    /// Cascades of view 0 for the light currently planned.
    cascades: SmallVec<[CascadeSplit; MAX_CASCADES as usize]>,
    frame: ShadowFrame,
}

impl<'a> ShadowPlanner<'a> {
    fn new(ctx: &'a SetupContext<'a>) -> Self {
        Self {
            ctx,
            cascades: SmallVec::new(),
            frame: ShadowFrame::default(),
        }
    }

    fn settings(&self) -> &'a ShadowSettings {
        self.ctx.settings
    }

    fn views(&self) -> &'a [ViewInfo] {
        self.ctx.views
    }

    fn finish(mut self) -> ShadowFrame {
        self.frame.shadows.sort_by_key(ProjectedShadow::sort_key);
        for (id, shadow) in self.frame.shadows.iter_mut().enumerate() {
            shadow.id = id;
        }
        self.frame
    }

    fn push(&mut self, shadow: ProjectedShadow) {
        let stats = &mut self.frame.stats;
        match shadow.kind {
            ShadowKind::PerObject => stats.per_object += 1,
            ShadowKind::PreShadow => stats.preshadows += 1,
            ShadowKind::WholeSceneCascade { .. } => stats.cascades += 1,
            ShadowKind::WholeScene => stats.whole_scene += 1,
            ShadowKind::OnePassPoint | ShadowKind::CubeFace { .. } => stats.cube += 1,
            ShadowKind::PlanarReflection => stats.planar_reflections += 1,
        }
        self.frame.shadows.push(shadow);
    }

    fn view_dependent_alphas(&self, view: usize) -> SmallVec<[f32; 2]> {
        (0..self.views().len())
            .map(|i| if i == view { 1.0 } else { 0.0 })
            .collect()
    }

    // ========================================================================
    // Whole-scene shadows
    // ========================================================================

    fn plan_whole_scene(&mut self, light_key: LightKey, light: &LightSceneInfo) {
        self.cascades.clear();
        let settings = self.settings();
        let whole_scene = light.wants_whole_scene_shadows();

        match light.desc.light_type {
            LightType::Directional => {
                if whole_scene {
                    self.plan_cascades(light_key, light);
                }
                if light.flags().contains(LightFlags::CAST_DYNAMIC_SHADOWS) {
                    self.plan_planar_reflections(light_key, light);
                }
            }
            LightType::Spot { .. } if whole_scene => {
                let limits = ResolutionLimits::for_light(light, settings);
                let Some((desired, alphas)) = self.whole_scene_resolution(light, limits) else {
                    return;
                };
                let Some(initializer) = light.spot_whole_scene_initializer() else {
                    return;
                };
                let size = shadow_size(desired, limits.max);
                let mut shadow =
                    ProjectedShadow::new(light_key, light, None, ShadowKind::WholeScene, initializer, size, size, alphas);
                shadow.max_screen_percent = max_screen_percent(self.views(), light.origin(), light.desc.radius);
                shadow.update_depth_bias(light, settings);
                self.push(shadow);
            }
            LightType::Point if whole_scene => {
                let limits = ResolutionLimits::for_light(light, settings);
                let Some((desired, alphas)) = self.whole_scene_resolution(light, limits) else {
                    return;
                };
                let size = floor_pow2(desired.clamp(1, settings.cube_shadow_resolution.max(1)));
                let percent = max_screen_percent(self.views(), light.origin(), light.desc.radius);
                if settings.render_one_pass_point_light_shadows && self.ctx.caps.geometry_amplification {
                    let mut shadow = ProjectedShadow::new(
                        light_key,
                        light,
                        None,
                        ShadowKind::OnePassPoint,
                        light.one_pass_point_initializer(),
                        size,
                        size,
                        alphas,
                    );
                    shadow.max_screen_percent = percent;
                    shadow.update_depth_bias(light, settings);
                    self.push(shadow);
                } else {
                    for face in 0..6u8 {
                        let mut shadow = ProjectedShadow::new(
                            light_key,
                            light,
                            None,
                            ShadowKind::CubeFace { face },
                            light.cube_face_initializer(usize::from(face)),
                            size,
                            size,
                            alphas.clone(),
                        );
                        shadow.max_screen_percent = percent;
                        shadow.update_depth_bias(light, settings);
                        self.push(shadow);
                    }
                }
            }
            _ => {}
        }
    }

    /// Desired resolution and per-view fade of a shadow sized by the light's
    /// own sphere. `None` when it fades out everywhere.
    fn whole_scene_resolution(
        &mut self,
        light: &LightSceneInfo,
        limits: ResolutionLimits,
    ) -> Option<(u32, SmallVec<[f32; 2]>)> {
        let settings = self.settings();
        let unclamped = unclamped_resolutions(
            self.views(),
            light.origin(),
            light.desc.radius,
            settings.shadow_texels_per_pixel,
        );
        let alphas: SmallVec<[f32; 2]> = unclamped
            .iter()
            .map(|&u| resolution_fade_alpha(u, limits.fade, limits.min, settings.shadow_fade_exponent))
            .collect();
        if max_alpha(&alphas) <= MIN_FADE_ALPHA {
            self.frame.stats.culled_by_fade += 1;
            return None;
        }
        let max_unclamped = unclamped.iter().copied().max().unwrap_or(0);
        Some((max_unclamped.clamp(limits.min.min(limits.max), limits.max), alphas))
    }

    fn plan_cascades(&mut self, light_key: LightKey, light: &LightSceneInfo) {
        let settings = self.settings();
        let Some(view) = self.views().first() else {
            return;
        };
        self.cascades = view_cascades(
            view,
            settings.cascade_count,
            settings.whole_scene_shadow_distance,
            settings.cascade_distribution_exponent,
        );
        let cascades = self.cascades.clone();
        for split in cascades {
            let buffer = if split.index == 0 {
                settings.dominant_shadow_buffer_size
            } else {
                settings.shadow_depth_buffer_size
            };
            let resolution = (settings.whole_scene_shadow_resolution >> split.index)
                .min(buffer.saturating_sub(2 * SHADOW_BORDER))
                .max(1);
            let Some(initializer) = light.cascade_initializer(split.bounds, split.index, resolution) else {
                continue;
            };
            let mut shadow = ProjectedShadow::new(
                light_key,
                light,
                None,
                ShadowKind::WholeSceneCascade { split: split.index },
                initializer,
                resolution,
                resolution,
                self.view_dependent_alphas(view.index),
            );
            shadow.dependent_view = Some(view.index);
            shadow.whole_scene_bounds = Some(split.bounds);
            shadow.max_screen_percent = 1.0;
            shadow.update_depth_bias(light, settings);
            log::debug!(
                "Cascade {} of light {:?}: depth [{:.2}, {:.2}), {}x{}",
                split.index,
                light.id(),
                split.near,
                split.far,
                resolution,
                resolution
            );
            self.push(shadow);
        }
    }

    fn plan_planar_reflections(&mut self, light_key: LightKey, light: &LightSceneInfo) {
        let settings = self.settings();
        for view in self.views() {
            let Some(plane) = view.desc.reflection_plane else {
                continue;
            };
            let normal = plane.truncate();
            if normal.length_squared() < 1e-6 {
                continue;
            }
            let p = &view.desc.projection_matrix;
            let near = view.desc.near_clip;
            let far = settings.whole_scene_shadow_distance.max(near + 1.0);
            let slice = slice_bounding_sphere(
                view.desc.origin,
                view.desc.forward(),
                1.0 / p.x_axis.x.abs().max(f32::EPSILON),
                1.0 / p.y_axis.y.abs().max(f32::EPSILON),
                near,
                far,
            );
            // Mirror the covered sphere across the plane.
            let n = normal.normalize();
            let d = plane.w / normal.length();
            let center = slice.center - 2.0 * (n.dot(slice.center) + d) * n;
            let bounds = Sphere::new(center, slice.radius);

            let resolution = settings
                .whole_scene_shadow_resolution
                .min(settings.shadow_depth_buffer_size.saturating_sub(2 * SHADOW_BORDER))
                .max(1);
            let Some(mut initializer) = light.cascade_initializer(bounds, 0, resolution) else {
                continue;
            };
            initializer.split_index = None;
            let mut shadow = ProjectedShadow::new(
                light_key,
                light,
                None,
                ShadowKind::PlanarReflection,
                initializer,
                resolution,
                resolution,
                self.view_dependent_alphas(view.index),
            );
            shadow.dependent_view = Some(view.index);
            shadow.whole_scene_bounds = Some(bounds);
            shadow.update_depth_bias(light, settings);
            self.push(shadow);
        }
    }

    // ========================================================================
    // Per-interaction shadows
    // ========================================================================

    /// Whether a whole-scene shadow of `light` already shadows `bounds`.
    fn covered_by_whole_scene(&self, light: &LightSceneInfo, bounds: &BoxSphereBounds) -> bool {
        if !light.wants_whole_scene_shadows() {
            return false;
        }
        match light.desc.light_type {
            LightType::Directional => self.views().first().is_some_and(|view| {
                !self.cascades.is_empty()
                    && view.desc.origin.distance(bounds.origin) + bounds.sphere_radius
                        <= self.settings().whole_scene_shadow_distance
            }),
            LightType::Point | LightType::Spot { .. } => true,
        }
    }

    /// Whether a cascade covers the subject closely enough that its
    /// preshadow would add nothing.
    fn cascade_replaces_preshadow(&self, bounds: &BoxSphereBounds) -> bool {
        let Some(view) = self.views().first() else {
            return false;
        };
        let radius = bounds.sphere_radius;
        let fade_distance =
            (self.settings().whole_scene_shadow_distance - self.settings().cascade_preshadow_fade_margin - radius)
                .max(0.0);
        if view.desc.origin.distance_squared(bounds.origin) >= fade_distance * fade_distance {
            return false;
        }
        self.cascades.iter().any(|split| {
            let inner = (split.bounds.radius - radius).max(0.0);
            split.bounds.center.distance_squared(bounds.origin) < inner * inner
        })
    }

    /// Plans the shadows of one interaction. Returns the advanced hysteresis
    /// state when the light fades modulated shadows.
    #[allow(clippy::too_many_arguments)]
    fn plan_interaction(
        &mut self,
        cache: &mut PreshadowCache,
        light_key: LightKey,
        light: &LightSceneInfo,
        primitive_key: PrimitiveKey,
        primitive: &PrimitiveSceneInfo,
        interaction_is_dynamic: bool,
        mut hysteresis: HysteresisState,
    ) -> Option<HysteresisState> {
        let settings = self.settings();
        let views = self.views();

        // Only the brightest dominant light shadows a primitive.
        if light.is_dominant() && primitive.brightest_dominant_light != Some(light_key) {
            return None;
        }

        let subject_visible = views.iter().any(|view| view.is_visible(primitive_key));
        let params = HysteresisParams {
            fade_time: light.desc.mod_shadow_fadeout_time,
            exponent: light.desc.mod_shadow_fadeout_exponent,
        };
        let uses_hysteresis = params.fade_time > f32::EPSILON;
        if !subject_visible && !uses_hysteresis {
            return None;
        }
        let hysteresis_alpha = hysteresis_fade_alpha(
            &mut hysteresis,
            params,
            subject_visible,
            self.ctx.now - primitive.last_visibility_change_time,
            self.ctx.now - primitive.last_render_time,
        );
        let updated = uses_hysteresis.then_some(hysteresis);
        if hysteresis_alpha <= MIN_FADE_ALPHA {
            self.frame.stats.culled_by_fade += 1;
            return updated;
        }

        let bounds = *primitive.bounds();
        let limits = ResolutionLimits::for_light(light, settings);
        let unclamped =
            unclamped_resolutions(views, bounds.origin, bounds.sphere_radius, settings.shadow_texels_per_pixel);
        let allow_fade = primitive.has(PrimitiveFlags::ALLOW_SHADOW_FADE);
        let exponent = settings.shadow_fade_exponent;

        let fade_alphas: SmallVec<[f32; 2]> = unclamped
            .iter()
            .map(|&u| {
                let alpha = if allow_fade {
                    resolution_fade_alpha(u, limits.fade, limits.min, exponent)
                } else {
                    1.0
                };
                alpha * hysteresis_alpha
            })
            .collect();
        let preshadow_alphas: SmallVec<[f32; 2]> = unclamped
            .iter()
            .map(|&u| {
                let u = (u as f32 * settings.pre_shadow_resolution_factor) as u32;
                resolution_fade_alpha(
                    u,
                    settings.pre_shadow_fade_resolution,
                    settings.min_pre_shadow_resolution,
                    exponent,
                ) * hysteresis_alpha
            })
            .collect();

        let render_preshadow = light.flags().contains(LightFlags::ALLOW_PRESHADOW)
            && light.has_static_shadowing()
            && primitive.has(PrimitiveFlags::ALLOW_PRESHADOW)
            && interaction_is_dynamic
            && subject_visible;

        let max_fade = max_alpha(&fade_alphas);
        let max_preshadow_fade = if render_preshadow { max_alpha(&preshadow_alphas) } else { 0.0 };
        if max_fade <= MIN_FADE_ALPHA && max_preshadow_fade <= MIN_FADE_ALPHA {
            self.frame.stats.culled_by_fade += 1;
            log::debug!(
                "Shadow of {:?} by {:?} faded out (max resolution {:?})",
                primitive.id(),
                light.id(),
                unclamped.iter().max()
            );
            return updated;
        }

        let max_unclamped = unclamped.iter().copied().max().unwrap_or(0);
        let max_desired = max_unclamped.clamp(limits.min.min(limits.max), limits.max);
        let relevance = views
            .iter()
            .fold(primitive.desc.relevance, |r, view| r | view.relevance(primitive_key));
        let subject = Some((primitive_key, primitive.id()));
        let percent = max_screen_percent(views, bounds.origin, bounds.sphere_radius);

        // Per-object shadow.
        let movable_dominant = light.is_dominant() && !light.has_static_shadowing();
        if max_fade > MIN_FADE_ALPHA
            && relevance.contains(PrimitiveRelevance::OPAQUE)
            && !movable_dominant
            && !self.covered_by_whole_scene(light, &bounds)
        {
            if let Some(initializer) = light.per_object_initializer(&bounds, settings) {
                let aspect = initializer.aspect_ratio.max(f32::EPSILON);
                let size_x = shadow_size(max_desired, limits.max);
                let size_y = shadow_size((max_desired as f32 / aspect) as u32, limits.max);
                let mut shadow = ProjectedShadow::new(
                    light_key,
                    light,
                    subject,
                    ShadowKind::PerObject,
                    initializer,
                    size_x,
                    size_y,
                    fade_alphas,
                );
                shadow.max_screen_percent = percent;
                shadow.self_shadow_only = primitive.has(PrimitiveFlags::SELF_SHADOW_ONLY)
                    || light.flags().contains(LightFlags::SELF_SHADOW_ONLY);
                shadow.update_depth_bias(light, settings);
                self.push(shadow);
            }
        }

        // Preshadow.
        if max_preshadow_fade > MIN_FADE_ALPHA {
            let opaque_only = relevance.contains(PrimitiveRelevance::OPAQUE)
                && !relevance.intersects(PrimitiveRelevance::TRANSLUCENT | PrimitiveRelevance::FOREGROUND);
            if opaque_only && !self.cascades.is_empty() && self.cascade_replaces_preshadow(&bounds) {
                self.frame.stats.culled_by_cascade += 1;
                return updated;
            }
            self.plan_preshadow(cache, light_key, light, primitive, subject, max_desired, limits, preshadow_alphas, percent);
        }
        updated
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_preshadow(
        &mut self,
        cache: &mut PreshadowCache,
        light_key: LightKey,
        light: &LightSceneInfo,
        primitive: &PrimitiveSceneInfo,
        subject: Option<(PrimitiveKey, PrimitiveId)>,
        max_desired: u32,
        limits: ResolutionLimits,
        alphas: SmallVec<[f32; 2]>,
        percent: f32,
    ) {
        let settings = self.settings();
        let factor = settings.pre_shadow_resolution_factor;
        let live_bounds = *primitive.bounds();
        let max = ((limits.max as f32 * factor) as u32).max(1);
        let aspect_of = |init: &ProjectedShadowInitializer| {
            init.aspect_ratio.max(f32::EPSILON)
        };

        if settings.cache_preshadows {
            let key = (primitive.id(), light.id());
            self.frame.referenced_preshadows.insert(key);

            let desired = (max_desired as f32 * factor) as u32;
            // Resolution the request would get; the cache must match it exactly.
            let expanded_bounds = live_bounds.expand_by_fraction(settings.preshadow_expand_fraction);
            let expanded = light.per_object_initializer(&expanded_bounds, settings);
            let Some(expanded) = expanded else {
                return;
            };
            let size_x = shadow_size(desired, max);
            let size_y = shadow_size((desired as f32 / aspect_of(&expanded)) as u32, max);

            let hit = cache
                .lookup(primitive.id(), light.id(), &live_bounds, size_x, size_y)
                .cloned();
            if let (Some(entry), Some(texture)) = (hit, cache.texture()) {
                let mut shadow = ProjectedShadow::new(
                    light_key,
                    light,
                    subject,
                    ShadowKind::PreShadow,
                    entry.initializer.clone(),
                    entry.resolution_x,
                    entry.resolution_y,
                    alphas,
                );
                shadow.cache_bounds = Some(entry.bounds);
                shadow.depths_cached = true;
                shadow.allocated_in_cache = true;
                shadow.state = ShadowState::Allocated;
                shadow.target = Some(ShadowTarget {
                    atlas: AtlasKind::PreshadowCache,
                    texture,
                    rect: entry.rect,
                    buffer_width: cache.size(),
                    buffer_height: cache.size(),
                });
                self.finish_preshadow(shadow, subject, light, percent);
                self.frame.stats.cache_hits += 1;
                return;
            }
            self.frame.stats.cache_misses += 1;

            let mut shadow = ProjectedShadow::new(
                light_key,
                light,
                subject,
                ShadowKind::PreShadow,
                expanded,
                size_x,
                size_y,
                alphas,
            );
            shadow.cache_bounds = Some(expanded_bounds);
            self.finish_preshadow(shadow, subject, light, percent);
            return;
        }

        let Some(initializer) = light.per_object_initializer(&live_bounds, settings) else {
            return;
        };
        let desired = (max_desired as f32 * factor) as u32;
        let size_x = shadow_size(desired, max);
        let size_y = shadow_size((desired as f32 / aspect_of(&initializer)) as u32, max);
        let shadow = ProjectedShadow::new(
            light_key,
            light,
            subject,
            ShadowKind::PreShadow,
            initializer,
            size_x,
            size_y,
            alphas,
        );
        self.finish_preshadow(shadow, subject, light, percent);
    }

    fn finish_preshadow(
        &mut self,
        mut shadow: ProjectedShadow,
        subject: Option<(PrimitiveKey, PrimitiveId)>,
        light: &LightSceneInfo,
        percent: f32,
    ) {
        // The subject is always the first receiver of its preshadow.
        if let Some((key, _)) = subject {
            shadow.receiver_primitives.push(key);
        }
        shadow.max_screen_percent = percent;
        shadow.update_depth_bias(light, self.settings());
        self.push(shadow);
    }
}

// ============================================================================
// Shadow visibility
// ============================================================================

/// Fills each view's shadow visibility and relevance masks.
///
/// `is_occluded(view, shadow)` is asked only for per-object shadows and
/// preshadows that are otherwise visible in the view.
pub fn compute_shadow_visibility(
    shadows: &[ProjectedShadow],
    views: &mut [ViewInfo],
    scene: &Scene,
    mut is_occluded: impl FnMut(usize, &ProjectedShadow) -> bool,
) {
    for view in views.iter_mut() {
        view.projected_shadow_visibility = vec![false; shadows.len()];
        view.projected_shadow_relevance = vec![PrimitiveRelevance::empty(); shadows.len()];

        for shadow in shadows {
            if shadow.dependent_view.is_some_and(|d| d != view.index)
                || shadow.fade_alpha(view.index) <= MIN_FADE_ALPHA
            {
                continue;
            }
            let (visible, relevance) = match shadow.kind {
                ShadowKind::PerObject | ShadowKind::PreShadow => {
                    let receivers = shadow.occlusion_bounds();
                    let in_frustum = receivers.is_valid() && view.frustum.intersects_aabb(&receivers);
                    let visible = in_frustum && !is_occluded(view.index, shadow);
                    let relevance = shadow
                        .subject
                        .map(|(key, _)| view.relevance(key))
                        .filter(|r| !r.is_empty())
                        .unwrap_or(PrimitiveRelevance::OPAQUE);
                    (visible, relevance)
                }
                _ => {
                    let visible = scene
                        .light(shadow.light)
                        .and_then(LightSceneInfo::bounding_sphere)
                        .is_none_or(|s| view.frustum.intersects_sphere(s.center, s.radius));
                    (visible, PrimitiveRelevance::OPAQUE)
                }
            };
            view.projected_shadow_visibility[shadow.id] = visible;
            if visible {
                view.projected_shadow_relevance[shadow.id] = relevance;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_size_rounds_below_the_desired_ceiling() {
        assert_eq!(shadow_size(100, 502), 64);
        assert_eq!(shadow_size(64, 502), 32);
        assert_eq!(shadow_size(65, 502), 64);
        assert_eq!(shadow_size(600, 502), 502);
        assert_eq!(shadow_size(1, 502), 1);
    }

    #[test]
    fn light_overrides_resolution_limits() {
        let settings = ShadowSettings::default();
        let mut desc = crate::scene::LightDesc::point(glam::Vec3::ZERO, 10.0);
        desc.max_shadow_resolution = 128;
        desc.min_shadow_resolution = 16;
        let limits = ResolutionLimits::for_light(&LightSceneInfo::new(desc), &settings);
        assert_eq!(limits.max, 128 - 2 * SHADOW_BORDER);
        assert_eq!(limits.min, 16);
        assert_eq!(limits.fade, settings.shadow_fade_resolution);
    }
}

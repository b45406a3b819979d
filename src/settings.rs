//! Shadow Settings & Configuration Snapshot
//!
//! This module defines [`ShadowSettings`], the full configuration surface of
//! the shadow subsystem. The renderer reads it once at frame start and passes
//! the immutable snapshot down to every stage, so a settings change never
//! lands halfway through a frame.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use umbra::settings::ShadowSettings;
//!
//! // Defaults tuned for a 1080p view
//! let settings = ShadowSettings::default();
//!
//! // Override a few knobs from JSON (missing fields keep their defaults)
//! let settings = ShadowSettings::from_json_str(r#"{ "max_shadow_resolution": 1024 }"#)?;
//!
//! renderer.set_settings(settings)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ShadowError};

/// Texels of padding around every shadow rectangle in an atlas.
///
/// Filtering kernels may read up to this far outside the shadow's own
/// region, so the border is cleared to the far depth.
pub const SHADOW_BORDER: u32 = 5;

// ---------------------------------------------------------------------------
// ShadowSettings
// ---------------------------------------------------------------------------

/// Configuration snapshot for shadow scheduling, packing and projection.
///
/// # Resolution & Fade
///
/// | Field                       | Default | Meaning                                              |
/// |-----------------------------|---------|------------------------------------------------------|
/// | `shadow_texels_per_pixel`   | 1.27324 | Shadow texels per projected screen pixel             |
/// | `min_shadow_resolution`     | 32      | Below this a per-object shadow is culled             |
/// | `shadow_fade_resolution`    | 64      | Above this a per-object shadow is fully opaque       |
/// | `max_shadow_resolution`     | 512     | Upper clamp for per-object shadows                   |
/// | `shadow_fade_exponent`      | 0.25    | Curve of the fade between min and fade resolution    |
///
/// # Preshadows
///
/// | Field                          | Default | Meaning                                           |
/// |--------------------------------|---------|---------------------------------------------------|
/// | `pre_shadow_resolution_factor` | 0.5     | Preshadow resolution relative to the subject's    |
/// | `min_pre_shadow_resolution`    | 8       | Preshadow cull threshold                          |
/// | `pre_shadow_fade_resolution`   | 16      | Preshadow fully-opaque threshold                  |
/// | `cache_preshadows`             | true    | Keep preshadow depths alive across frames         |
/// | `preshadow_expand_fraction`    | 0.15    | Bounds padding for cached preshadows              |
///
/// # Cascades
///
/// | Field                            | Default | Meaning                                        |
/// |----------------------------------|---------|------------------------------------------------|
/// | `cascade_count`                  | 3       | Splits per directional whole-scene light       |
/// | `cascade_distribution_exponent`  | 3.0     | Geometric growth of split depth ranges         |
/// | `whole_scene_shadow_distance`    | 200.0   | View distance covered by the last split        |
/// | `whole_scene_shadow_resolution`  | 2048    | Resolution of split 0; halves per split        |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowSettings {
    // ========================================================================
    // Filtering
    // ========================================================================
    /// Radius of the PCF disk in shadow-map texels.
    pub shadow_filter_radius: f32,
    /// Added to each light's filter quality before variant selection.
    pub shadow_filter_quality_bias: i32,
    /// Penumbra scale applied to cascade splits beyond the first.
    pub csm_split_penumbra_scale: f32,
    /// Scale of the depth-space soft transition for cascade splits.
    pub csm_split_soft_transition_distance_scale: f32,
    /// Depth bias growth per cascade split.
    pub csm_split_depth_bias_scale: f32,
    /// Depth-space soft transition width for whole-scene shadows.
    pub per_scene_shadow_transition: f32,
    /// Depth-space soft transition width for per-object shadows.
    pub per_object_shadow_transition: f32,
    /// Base depth bias, scaled by `512 / max(resolution)`.
    pub shadow_depth_bias: f32,

    // ========================================================================
    // Resolution & Fade
    // ========================================================================
    pub shadow_texels_per_pixel: f32,
    pub min_shadow_resolution: u32,
    pub max_shadow_resolution: u32,
    pub shadow_fade_resolution: u32,
    pub shadow_fade_exponent: f32,
    /// Bounds are projected from the origin instead of tightly fit.
    pub use_conservative_shadow_bounds: bool,

    // ========================================================================
    // Preshadows
    // ========================================================================
    pub pre_shadow_resolution_factor: f32,
    pub min_pre_shadow_resolution: u32,
    pub pre_shadow_fade_resolution: u32,
    pub cache_preshadows: bool,
    pub preshadow_expand_fraction: f32,
    pub directional_light_preshadow_near_plane_extension_factor: f32,
    /// Preshadows whose subject lies this far inside the cascade fade-out
    /// distance are dropped in favour of the cascade.
    pub cascade_preshadow_fade_margin: f32,

    // ========================================================================
    // Whole-Scene Shadows
    // ========================================================================
    pub cascade_count: u32,
    pub cascade_distribution_exponent: f32,
    pub whole_scene_shadow_distance: f32,
    pub whole_scene_shadow_resolution: u32,
    /// Render point-light cube shadows in a single amplified pass when the
    /// device supports geometry amplification.
    pub render_one_pass_point_light_shadows: bool,
    /// Resolution of one cube face for point-light whole-scene shadows.
    pub cube_shadow_resolution: u32,

    // ========================================================================
    // Draw Distance & Occlusion
    // ========================================================================
    pub max_draw_distance_scale: f32,
    pub max_occlusion_pixels_fraction: f32,
    /// Seconds a primitive stays "probably visible" without a positive query.
    pub primitive_probably_visible_time: f32,
    /// Seconds an occlusion history survives without being considered.
    pub occlusion_history_ttl: f32,
    /// Occlusion queries available per view.
    pub occlusion_query_pool_size: usize,

    // ========================================================================
    // Atlases
    // ========================================================================
    /// Edge length of the transient shadow depth atlas.
    pub shadow_depth_buffer_size: u32,
    /// Edge length of the dominant (split 0) atlas.
    pub dominant_shadow_buffer_size: u32,
    /// Edge length of the preshadow cache texture.
    pub preshadow_cache_size: u32,
    /// Allocation alignment in texels required by the backend (1 = none).
    pub atlas_alignment: u32,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            shadow_filter_radius: 2.0,
            shadow_filter_quality_bias: 0,
            csm_split_penumbra_scale: 0.5,
            csm_split_soft_transition_distance_scale: 4.0,
            csm_split_depth_bias_scale: 0.5,
            per_scene_shadow_transition: 0.02,
            per_object_shadow_transition: 0.005,
            shadow_depth_bias: 0.012,

            shadow_texels_per_pixel: 1.273_24,
            min_shadow_resolution: 32,
            max_shadow_resolution: 512,
            shadow_fade_resolution: 64,
            shadow_fade_exponent: 0.25,
            use_conservative_shadow_bounds: false,

            pre_shadow_resolution_factor: 0.5,
            min_pre_shadow_resolution: 8,
            pre_shadow_fade_resolution: 16,
            cache_preshadows: true,
            preshadow_expand_fraction: 0.15,
            directional_light_preshadow_near_plane_extension_factor: 1.0,
            cascade_preshadow_fade_margin: 2.0,

            cascade_count: 3,
            cascade_distribution_exponent: 3.0,
            whole_scene_shadow_distance: 200.0,
            whole_scene_shadow_resolution: 2048,
            render_one_pass_point_light_shadows: true,
            cube_shadow_resolution: 512,

            max_draw_distance_scale: 1.0,
            max_occlusion_pixels_fraction: 0.1,
            primitive_probably_visible_time: 8.0,
            occlusion_history_ttl: 10.0,
            occlusion_query_pool_size: 4096,

            shadow_depth_buffer_size: 2048,
            dominant_shadow_buffer_size: 2048,
            preshadow_cache_size: 1024,
            atlas_alignment: 1,
        }
    }
}

impl ShadowSettings {
    /// Parses a JSON object of overrides on top of the defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ShadowError::InvalidSettings(msg));

        if self.shadow_texels_per_pixel <= 0.0 {
            return fail(format!(
                "shadow_texels_per_pixel must be positive, got {}",
                self.shadow_texels_per_pixel
            ));
        }
        if self.min_shadow_resolution > self.max_shadow_resolution {
            return fail(format!(
                "min_shadow_resolution {} exceeds max_shadow_resolution {}",
                self.min_shadow_resolution, self.max_shadow_resolution
            ));
        }
        if self.min_pre_shadow_resolution > self.pre_shadow_fade_resolution {
            return fail(format!(
                "min_pre_shadow_resolution {} exceeds pre_shadow_fade_resolution {}",
                self.min_pre_shadow_resolution, self.pre_shadow_fade_resolution
            ));
        }
        for (name, size) in [
            ("shadow_depth_buffer_size", self.shadow_depth_buffer_size),
            ("dominant_shadow_buffer_size", self.dominant_shadow_buffer_size),
            ("preshadow_cache_size", self.preshadow_cache_size),
        ] {
            if size <= SHADOW_BORDER * 2 {
                return fail(format!("{name} {size} leaves no room inside the border"));
            }
        }
        if self.atlas_alignment == 0 {
            return fail("atlas_alignment must be at least 1".to_string());
        }
        if self.cascade_count > crate::renderer::shadows::cascades::MAX_CASCADES {
            return fail(format!(
                "cascade_count {} exceeds the supported maximum",
                self.cascade_count
            ));
        }
        if self.cascade_distribution_exponent < 1.0 {
            return fail(format!(
                "cascade_distribution_exponent must be >= 1, got {}",
                self.cascade_distribution_exponent
            ));
        }
        if self.pre_shadow_resolution_factor <= 0.0 {
            return fail("pre_shadow_resolution_factor must be positive".to_string());
        }
        Ok(())
    }

    /// Largest per-object resolution that still fits in the transient atlas.
    #[inline]
    #[must_use]
    pub fn max_per_object_resolution(&self) -> u32 {
        let border = SHADOW_BORDER * 2;
        self.max_shadow_resolution
            .saturating_sub(border)
            .min(self.shadow_depth_buffer_size.saturating_sub(border))
            .max(1)
    }

    /// Smallest per-object resolution, capped by the atlas.
    #[inline]
    #[must_use]
    pub fn min_per_object_resolution(&self) -> u32 {
        self.min_shadow_resolution
            .min(self.shadow_depth_buffer_size.saturating_sub(SHADOW_BORDER * 2))
    }

    /// Copy with every texture size capped at `caps.max_texture_size`, or
    /// `None` when all of them already fit.
    #[must_use]
    pub fn clamped_to_device(&self, caps: &GpuCapabilities) -> Option<Self> {
        let max = caps.max_texture_size;
        let sizes = [
            self.shadow_depth_buffer_size,
            self.dominant_shadow_buffer_size,
            self.preshadow_cache_size,
            self.cube_shadow_resolution,
        ];
        if sizes.iter().all(|&size| size <= max) {
            return None;
        }
        Some(Self {
            shadow_depth_buffer_size: self.shadow_depth_buffer_size.min(max),
            dominant_shadow_buffer_size: self.dominant_shadow_buffer_size.min(max),
            preshadow_cache_size: self.preshadow_cache_size.min(max),
            cube_shadow_resolution: self.cube_shadow_resolution.min(max),
            ..self.clone()
        })
    }
}

// ---------------------------------------------------------------------------
// GPU Capabilities
// ---------------------------------------------------------------------------

/// Optional device features that change which code paths are taken.
///
/// Missing capabilities are frame-scope degradations, not errors: projection
/// falls back to manual PCF and point lights to six per-face shadows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuCapabilities {
    /// Comparison samplers returning a filtered 0..1 result.
    pub hardware_pcf: bool,
    /// Four-neighbour depth gather in a single fetch.
    pub fetch4: bool,
    /// Depth formats can be sampled directly.
    pub depth_textures: bool,
    /// Geometry amplification with viewport-array indexing (one-pass cubes).
    pub geometry_amplification: bool,
    /// Largest 2D texture edge.
    pub max_texture_size: u32,
    /// Number of GPUs in alternate-frame rendering.
    pub gpu_count: u32,
}

impl Default for GpuCapabilities {
    fn default() -> Self {
        Self {
            hardware_pcf: true,
            fetch4: false,
            depth_textures: true,
            geometry_amplification: true,
            max_texture_size: 8192,
            gpu_count: 1,
        }
    }
}

impl GpuCapabilities {
    /// Frames an occlusion query stays in flight before it is read back.
    ///
    /// One frame on a single GPU, `gpus + 1` under alternate-frame rendering.
    #[inline]
    #[must_use]
    pub fn occlusion_buffered_frames(&self) -> u32 {
        if self.gpu_count > 1 {
            self.gpu_count + 1
        } else {
            1
        }
    }
}

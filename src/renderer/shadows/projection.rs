//! Shadow Projection
//!
//! Applies rendered shadow depths to the screen. Each visible shadow binds
//! one PCF permutation, scissors to the screen rectangle its receivers can
//! cover, and either draws a screen quad (depth buffer available) or its
//! receiver meshes (forward path).
//!
//! | Mode       | Target              | Blend              | Output                          |
//! |------------|---------------------|--------------------|---------------------------------|
//! | `Normal`   | light attenuation   | min                | `1 - fade * (1 - shadow)`       |
//! | `Modulate` | scene color         | multiply           | `lerp(1, mod color, fade * (1 - shadow))` |
//!
//! Self-shadowing splits a per-object shadow into [`ProjectionPass`]es:
//!
//! | Shadow / light                          | Passes                                     |
//! |-----------------------------------------|--------------------------------------------|
//! | self-shadow only                        | light mode on the subject                  |
//! | modulated, non-modulated self-shadowing | `Normal` on the subject, `Modulate` on the rest |
//! | both of the above                       | `Normal` on the subject                    |
//!
//! Subject-only passes draw the subject's meshes. The other passes draw as
//! above and leave subject masking to the host through
//! [`ShadowProjectionUniforms::receiver_mask`].

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use smallvec::{SmallVec, smallvec};

use super::fade::MIN_FADE_ALPHA;
use super::pcf::{PcfHardware, PcfPermutation, RotationTexture};
use super::projected::{ProjectedShadow, ShadowKind, ShadowState};
use crate::errors::Result;
use crate::math::bounds::Aabb;
use crate::rhi::{
    BlendMode, PixelShader, RenderDevice, RenderTargetBinding, SamplerDesc, SamplerHandle,
    ScissorRect, ShaderState, TextureDesc, TextureHandle, UniformSlot, VertexShader,
};
use crate::scene::view::{ShowFlags, ViewInfo};
use crate::scene::{LightSceneInfo, LightingChannels, PrimitiveKey, Scene, ShadowProjectionMode};
use crate::settings::{GpuCapabilities, ShadowSettings};

pub const SHADOW_DEPTH_SLOT: u32 = 0;
pub const ROTATION_SLOT: u32 = 1;

/// Per shadow and view block of the projection shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShadowProjectionUniforms {
    pub screen_to_shadow: [[f32; 4]; 4],
    /// `(width, height, 1 / width, 1 / height)` of the shadow texture.
    pub buffer_size: [f32; 4],
    pub mod_shadow_color: [f32; 4],
    /// Disk radius in texels.
    pub filter_radius: f32,
    pub fade_alpha: f32,
    /// Depth range, in normalised shadow depth, over which a receiver fades
    /// from lit to shadowed.
    pub transition: f32,
    pub lighting_channel_mask: u32,
    /// A [`ReceiverMask`] value.
    pub receiver_mask: u32,
    pub _padding: [u32; 3],
}

/// Pixels one projection pass may shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReceiverMask {
    All = 0,
    SubjectOnly = 1,
    ExcludeSubject = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionPass {
    pub mode: ShadowProjectionMode,
    pub mask: ReceiverMask,
}

/// Passes `shadow` projects with under `light`.
#[must_use]
pub fn projection_passes(shadow: &ProjectedShadow, light: &LightSceneInfo) -> SmallVec<[ProjectionPass; 2]> {
    let mode = light.desc.projection_mode;
    let own_mask = if shadow.self_shadow_only {
        ReceiverMask::SubjectOnly
    } else {
        ReceiverMask::All
    };
    let split_self_shadow = shadow.kind == ShadowKind::PerObject
        && mode == ShadowProjectionMode::Modulate
        && light.non_modulated_self_shadowing();
    if !split_self_shadow {
        return smallvec![ProjectionPass { mode, mask: own_mask }];
    }

    let mut passes: SmallVec<[ProjectionPass; 2]> = smallvec![ProjectionPass {
        mode: ShadowProjectionMode::Normal,
        mask: ReceiverMask::SubjectOnly,
    }];
    if !shadow.self_shadow_only {
        passes.push(ProjectionPass {
            mode: ShadowProjectionMode::Modulate,
            mask: ReceiverMask::ExcludeSubject,
        });
    }
    passes
}

/// Samplers and the rotation texture shared by every projection.
#[derive(Debug)]
pub struct ProjectionResources {
    pub compare_sampler: SamplerHandle,
    pub point_sampler: SamplerHandle,
    pub rotation_sampler: SamplerHandle,
    pub rotation_texture: TextureHandle,
}

impl ProjectionResources {
    pub fn new(device: &mut dyn RenderDevice, rotation: &RotationTexture) -> Result<Self> {
        let compare_sampler = device.create_sampler(&SamplerDesc::COMPARE_LESS)?;
        let point_sampler = device.create_sampler(&SamplerDesc::POINT_CLAMP)?;
        let rotation_sampler = device.create_sampler(&SamplerDesc::BILINEAR_WRAP)?;
        let rotation_texture = device.create_texture(&TextureDesc::lookup(
            "Shadow Rotation",
            rotation.size(),
            rotation.size(),
            wgpu::TextureFormat::Rg8Unorm,
        ))?;
        device.write_texture(rotation_texture, &rotation.to_rg8());
        Ok(Self {
            compare_sampler,
            point_sampler,
            rotation_sampler,
            rotation_texture,
        })
    }

    pub fn release(self, device: &mut dyn RenderDevice) {
        device.destroy_sampler(self.compare_sampler);
        device.destroy_sampler(self.point_sampler);
        device.destroy_sampler(self.rotation_sampler);
        device.destroy_texture(self.rotation_texture);
    }
}

/// Filter radius in texels; cascades widen it per split to keep the
/// penumbra a similar world size.
#[must_use]
pub fn filter_radius(shadow: &ProjectedShadow, settings: &ShadowSettings) -> f32 {
    let split = shadow.kind.split().unwrap_or(0);
    settings.shadow_filter_radius * settings.csm_split_penumbra_scale.powi(split as i32)
}

/// Receiver depth transition in world units.
#[must_use]
pub fn transition_distance(shadow: &ProjectedShadow, settings: &ShadowSettings) -> f32 {
    if shadow.is_whole_scene() {
        let split = shadow.kind.split().unwrap_or(0) as f32;
        settings.per_scene_shadow_transition * (1.0 + split * settings.csm_split_soft_transition_distance_scale)
    } else {
        settings.per_object_shadow_transition
    }
}

/// World-space box the shadow can darken.
fn projection_bounds(shadow: &ProjectedShadow) -> Aabb {
    if shadow.kind.is_cube() {
        let r = Vec3::splat(shadow.initializer.max_subject_depth);
        return Aabb::new(shadow.light_origin - r, shadow.light_origin + r);
    }
    if let Some(sphere) = shadow.whole_scene_bounds {
        let r = Vec3::splat(sphere.radius);
        return Aabb::new(sphere.center - r, sphere.center + r);
    }
    shadow.occlusion_bounds()
}

/// Screen rectangle covering `bounds`, or the whole view when any corner is
/// behind the eye.
#[must_use]
pub fn projection_scissor(view: &ViewInfo, bounds: &Aabb) -> Option<ScissorRect> {
    let size = view.desc.size;
    let full = ScissorRect {
        x: 0,
        y: 0,
        width: size.x,
        height: size.y,
    };
    if !bounds.is_valid() {
        return Some(full);
    }
    let mut min = glam::Vec2::splat(f32::MAX);
    let mut max = glam::Vec2::splat(f32::MIN);
    for corner in bounds.corners() {
        let clip = view.world_to_clip(corner);
        if clip.w <= f32::EPSILON {
            return Some(full);
        }
        let ndc = clip.truncate().truncate() / clip.w;
        min = min.min(ndc);
        max = max.max(ndc);
    }
    let to_pixel_x = |ndc: f32| ((ndc * 0.5 + 0.5) * size.x as f32).clamp(0.0, size.x as f32);
    let to_pixel_y = |ndc: f32| ((0.5 - ndc * 0.5) * size.y as f32).clamp(0.0, size.y as f32);
    let x0 = to_pixel_x(min.x).floor() as u32;
    let x1 = to_pixel_x(max.x).ceil() as u32;
    let y0 = to_pixel_y(max.y).floor() as u32;
    let y1 = to_pixel_y(min.y).ceil() as u32;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(ScissorRect {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

#[must_use]
pub fn projection_uniforms(
    shadow: &ProjectedShadow,
    light: &LightSceneInfo,
    view: &ViewInfo,
    settings: &ShadowSettings,
) -> ShadowProjectionUniforms {
    let (w, h) = shadow
        .target
        .map(|t| (t.buffer_width.max(1) as f32, t.buffer_height.max(1) as f32))
        .unwrap_or((1.0, 1.0));
    ShadowProjectionUniforms {
        screen_to_shadow: shadow.screen_to_shadow(view).to_cols_array_2d(),
        buffer_size: [w, h, 1.0 / w, 1.0 / h],
        mod_shadow_color: light.desc.mod_shadow_color.to_array(),
        filter_radius: filter_radius(shadow, settings),
        fade_alpha: shadow.fade_alpha(view.index),
        transition: transition_distance(shadow, settings) * shadow.inv_max_subject_depth,
        lighting_channel_mask: light.desc.lighting_channels.bits(),
        receiver_mask: ReceiverMask::All as u32,
        _padding: [0; 3],
    }
}

/// World-space box a subject-only pass can darken.
fn subject_bounds(shadow: &ProjectedShadow, scene: &Scene) -> Option<Aabb> {
    let (key, _) = shadow.subject?;
    scene.primitive(key).map(|p| p.bounds().aabb())
}

fn draw_primitive_meshes(device: &mut dyn RenderDevice, scene: &Scene, keys: &[PrimitiveKey]) {
    for &key in keys {
        let Some(primitive) = scene.primitive(key) else {
            continue;
        };
        if let Some(mesh) = primitive.desc.dynamic_mesh {
            device.draw_indexed_primitives(mesh, 1);
        }
        for mesh in &primitive.static_meshes {
            device.draw_indexed_primitives(mesh.desc.mesh, 1);
        }
    }
}

/// Projects `shadow` onto `view`. Returns whether anything was drawn.
pub fn project_shadow(
    device: &mut dyn RenderDevice,
    resources: &ProjectionResources,
    shadow: &mut ProjectedShadow,
    view: &ViewInfo,
    scene: &Scene,
    settings: &ShadowSettings,
    caps: &GpuCapabilities,
) -> bool {
    let visible = view.projected_shadow_visibility.get(shadow.id).copied().unwrap_or(false);
    if !visible
        || shadow.fade_alpha(view.index) <= MIN_FADE_ALPHA
        || view.desc.show_flags.contains(ShowFlags::WIREFRAME)
        || !view.desc.show_flags.contains(ShowFlags::SHADOWS)
    {
        return false;
    }
    let (Some(target), Some(light)) = (shadow.target, scene.light(shadow.light)) else {
        return false;
    };

    let permutation = PcfPermutation::select(light.desc.filter_quality.biased(settings.shadow_filter_quality_bias), caps);
    let forward = !caps.depth_textures;
    let depth_sampler = if permutation.hardware == PcfHardware::HardwarePcf {
        resources.compare_sampler
    } else {
        resources.point_sampler
    };
    let subject_keys: SmallVec<[PrimitiveKey; 1]> = shadow.subject.map(|(key, _)| key).into_iter().collect();

    let mut drawn = false;
    for pass in projection_passes(shadow, light) {
        let subject_only = pass.mask == ReceiverMask::SubjectOnly;
        let bounds = if subject_only {
            subject_bounds(shadow, scene)
        } else {
            Some(projection_bounds(shadow))
        };
        let Some(scissor) = bounds.and_then(|b| projection_scissor(view, &b)) else {
            continue;
        };
        let (render_target, blend) = match pass.mode {
            ShadowProjectionMode::Normal => (RenderTargetBinding::LightAttenuation, BlendMode::MinAttenuation),
            ShadowProjectionMode::Modulate => (RenderTargetBinding::SceneColor, BlendMode::Modulate),
        };
        let draw_receivers = forward || subject_only;

        device.set_render_target(render_target);
        device.set_blend_mode(blend);
        device.set_scissor(Some(scissor));
        device.bind_shaders(&ShaderState {
            vertex: if draw_receivers {
                VertexShader::ProjectionReceiver
            } else {
                VertexShader::ScreenQuad
            },
            pixel: Some(PixelShader::ShadowProjection(permutation)),
            geometry: None,
            cull_mode: draw_receivers.then_some(wgpu::Face::Back),
        });
        device.bind_texture(SHADOW_DEPTH_SLOT, target.texture, depth_sampler);
        device.bind_texture(ROTATION_SLOT, resources.rotation_texture, resources.rotation_sampler);

        let uniforms = ShadowProjectionUniforms {
            receiver_mask: pass.mask as u32,
            ..projection_uniforms(shadow, light, view, settings)
        };
        device.set_uniforms(UniformSlot::ShadowProjection, bytemuck::bytes_of(&uniforms));

        if subject_only {
            draw_primitive_meshes(device, scene, &subject_keys);
        } else if forward {
            draw_primitive_meshes(device, scene, &shadow.receiver_primitives);
        } else {
            device.draw_fullscreen_quad();
        }
        device.set_scissor(None);
        device.set_blend_mode(BlendMode::Opaque);
        drawn = true;
    }
    if !drawn {
        return false;
    }

    if matches!(shadow.kind, ShadowKind::PreShadow | ShadowKind::PerObject) || shadow.state < ShadowState::Projected {
        shadow.state = ShadowState::Projected;
    }
    true
}

// ============================================================================
// CPU reference of the composite
// ============================================================================

/// Light attenuation for a pixel whose filtered shadow value is `shadow`
/// (`1` lit, `0` shadowed).
///
/// Pixels outside the light's channels are left unshadowed.
#[must_use]
pub fn shadow_attenuation(shadow: f32, fade_alpha: f32, light: LightingChannels, pixel: LightingChannels) -> f32 {
    if !light.intersects(pixel) {
        return 1.0;
    }
    1.0 - fade_alpha * (1.0 - shadow.clamp(0.0, 1.0))
}

/// Multiplier a modulated shadow applies to lit scene color.
#[must_use]
pub fn modulated_color(shadow: f32, fade_alpha: f32, mod_shadow_color: Vec4) -> Vec3 {
    let amount = fade_alpha * (1.0 - shadow.clamp(0.0, 1.0));
    Vec3::ONE.lerp(mod_shadow_color.truncate(), amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn fade_scales_attenuation() {
        let all = LightingChannels::all();
        assert!((shadow_attenuation(0.0, 1.0, all, all) - 0.0).abs() < EPSILON);
        assert!((shadow_attenuation(0.0, 0.25, all, all) - 0.75).abs() < EPSILON);
        assert!((shadow_attenuation(1.0, 1.0, all, all) - 1.0).abs() < EPSILON);
    }

    #[test]
    fn channel_mask_excludes_pixels() {
        let attenuation = shadow_attenuation(0.0, 1.0, LightingChannels::DYNAMIC, LightingChannels::STATIC);
        assert_eq!(attenuation, 1.0);
    }

    #[test]
    fn modulate_blends_towards_shadow_color() {
        let color = Vec4::new(0.2, 0.3, 0.4, 1.0);
        assert!((modulated_color(0.0, 1.0, color) - color.truncate()).length() < EPSILON);
        assert!((modulated_color(1.0, 1.0, color) - Vec3::ONE).length() < EPSILON);
        assert!((modulated_color(0.0, 0.5, color) - Vec3::new(0.6, 0.65, 0.7)).length() < EPSILON);
    }
}

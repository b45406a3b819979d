//! Shadow Depth Pass
//!
//! Renders the subjects of one allocated shadow into its atlas rectangle.
//!
//! ```text
//!   bind target ─► viewport (x + border, y + border, w, h)
//!               ─► clear the rectangle, border included
//!               ─► static draw list, grouped by shader
//!               ─► dynamic subjects
//! ```
//!
//! One-pass point shadows bind all six cube faces at once; the geometry
//! stage emits each triangle per face using the six face matrices, so every
//! subject is drawn exactly once.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::projected::{AtlasKind, ProjectedShadow, ShadowKind, ShadowState};
use crate::rhi::{
    GeometryShader, MeshHandle, PixelShader, RenderDevice, RenderTargetBinding, ScissorRect,
    ShaderState, UniformSlot, VertexShader, Viewport,
};
use crate::scene::Scene;

bitflags! {
    /// Depth shader permutation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
    pub struct DepthShaderFlags: u32 {
        /// Alpha-tested material; needs the masked pixel shader.
        const MASKED              = 1 << 0;
        const TWO_SIDED           = 1 << 1;
        /// Geometry amplification into six cube faces.
        const ONE_PASS_POINT      = 1 << 2;
        /// Depths in front of the near plane are clamped onto it.
        const CLAMP_TO_NEAR_PLANE = 1 << 3;
        /// Writes linear depth for perspective shadows.
        const PERSPECTIVE         = 1 << 4;
    }
}

impl DepthShaderFlags {
    /// Permutation shared by every draw of `shadow`.
    #[must_use]
    pub fn for_shadow(shadow: &ProjectedShadow) -> Self {
        let mut flags = Self::empty();
        if matches!(shadow.kind, ShadowKind::OnePassPoint) {
            flags |= Self::ONE_PASS_POINT;
        }
        // Occluders between the light and the near plane still have to
        // cast onto the subject.
        if shadow.is_preshadow() || (shadow.initializer.directional && shadow.is_whole_scene()) {
            flags |= Self::CLAMP_TO_NEAR_PLANE;
        }
        if !shadow.initializer.directional {
            flags |= Self::PERSPECTIVE;
        }
        flags
    }

    #[must_use]
    pub fn shader_state(self) -> ShaderState {
        ShaderState {
            vertex: VertexShader::ShadowDepth(self),
            pixel: self
                .contains(Self::MASKED)
                .then_some(PixelShader::ShadowDepthMasked),
            geometry: self
                .contains(Self::ONE_PASS_POINT)
                .then_some(GeometryShader::CubeAmplify),
            cull_mode: (!self.contains(Self::TWO_SIDED)).then_some(wgpu::Face::Back),
        }
    }
}

/// Per-shadow block of the depth pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShadowDepthUniforms {
    pub depth_bias: f32,
    pub inv_max_subject_depth: f32,
    pub clamp_to_near_plane: u32,
    pub perspective: u32,
}

/// Six face matrices of a one-pass cube shadow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CubeFaceUniforms {
    pub view_projections: [[[f32; 4]; 4]; 6],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepthPassStats {
    pub draws: usize,
    pub shader_binds: usize,
}

/// Renders the depths of `shadow`.
///
/// Shadows without a target are skipped, as are preshadows whose depths are
/// still cached from an earlier frame.
pub fn render_shadow_depths(
    device: &mut dyn RenderDevice,
    shadow: &mut ProjectedShadow,
    scene: &Scene,
) -> DepthPassStats {
    let mut stats = DepthPassStats::default();
    let Some(target) = shadow.target else {
        return stats;
    };
    if shadow.depths_cached {
        return stats;
    }

    let binding = match shadow.kind {
        ShadowKind::OnePassPoint => RenderTargetBinding::CubeLayered(target.texture),
        ShadowKind::CubeFace { face } if target.atlas == AtlasKind::Cube => {
            RenderTargetBinding::CubeFace {
                texture: target.texture,
                face,
            }
        }
        _ => RenderTargetBinding::ShadowDepth(target.texture),
    };
    device.set_render_target(binding);

    let rect = target.rect;
    device.set_scissor(Some(ScissorRect {
        x: rect.x,
        y: rect.y,
        width: rect.width,
        height: rect.height,
    }));
    device.clear_depth(1.0);
    device.set_viewport(Viewport {
        x: rect.x + shadow.border,
        y: rect.y + shadow.border,
        width: shadow.resolution_x,
        height: shadow.resolution_y,
    });

    let base_flags = DepthShaderFlags::for_shadow(shadow);
    let uniforms = ShadowDepthUniforms {
        depth_bias: shadow.depth_bias,
        inv_max_subject_depth: shadow.inv_max_subject_depth,
        clamp_to_near_plane: u32::from(base_flags.contains(DepthShaderFlags::CLAMP_TO_NEAR_PLANE)),
        perspective: u32::from(base_flags.contains(DepthShaderFlags::PERSPECTIVE)),
    };
    device.set_uniforms(UniformSlot::ShadowDepth, bytemuck::bytes_of(&uniforms));

    // The geometry stage applies the face matrices; draws only see the identity.
    let world_to_shadow = if let Some(faces) = shadow.one_pass_view_projections {
        let cube = CubeFaceUniforms {
            view_projections: faces.map(|m| m.to_cols_array_2d()),
        };
        device.set_uniforms(UniformSlot::CubeFaces, bytemuck::bytes_of(&cube));
        Mat4::IDENTITY
    } else {
        shadow.world_to_shadow()
    };

    let mut draws: Vec<(DepthShaderFlags, MeshHandle)> = shadow
        .static_mesh_draws
        .iter()
        .map(|draw| {
            let mut flags = base_flags;
            flags.set(DepthShaderFlags::MASKED, draw.masked);
            flags.set(DepthShaderFlags::TWO_SIDED, draw.two_sided);
            (flags, draw.mesh)
        })
        .collect();
    draws.extend(
        shadow
            .dynamic_subjects
            .iter()
            .filter_map(|&key| scene.primitive(key)?.desc.dynamic_mesh)
            .map(|mesh| (base_flags, mesh)),
    );
    // Stable sort keeps list order within a shader group.
    draws.sort_by_key(|&(flags, _)| flags);

    let mut bound = None;
    for (flags, mesh) in draws {
        if bound != Some(flags) {
            device.bind_shaders(&flags.shader_state());
            bound = Some(flags);
            stats.shader_binds += 1;
        }
        device.draw_shadow_depth(mesh, &world_to_shadow);
        stats.draws += 1;
    }
    device.set_scissor(None);

    shadow.state = ShadowState::DepthsRendered;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_draws_bind_the_masked_pixel_shader() {
        let state = (DepthShaderFlags::MASKED | DepthShaderFlags::PERSPECTIVE).shader_state();
        assert_eq!(state.pixel, Some(PixelShader::ShadowDepthMasked));
        assert_eq!(state.geometry, None);

        let cube = DepthShaderFlags::ONE_PASS_POINT.shader_state();
        assert_eq!(cube.pixel, None);
        assert_eq!(cube.geometry, Some(GeometryShader::CubeAmplify));
    }

    #[test]
    fn two_sided_draws_disable_culling() {
        assert_eq!(DepthShaderFlags::empty().shader_state().cull_mode, Some(wgpu::Face::Back));
        let two_sided = (DepthShaderFlags::TWO_SIDED | DepthShaderFlags::PERSPECTIVE).shader_state();
        assert_eq!(two_sided.cull_mode, None);
        assert_eq!(two_sided.pixel, None);
    }
}

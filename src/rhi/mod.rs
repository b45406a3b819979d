//! Device Abstraction
//!
//! The shadow pipeline never touches a graphics API directly. It talks to a
//! [`RenderDevice`] through opaque handles, and the host renderer maps those
//! calls onto its backend. Texture and sampler descriptions reuse the `wgpu`
//! vocabulary so a wgpu-based host can forward them unchanged.
//!
//! | Concern          | Calls                                                     |
//! |------------------|-----------------------------------------------------------|
//! | Resources        | `create_texture`, `write_texture`, `create_sampler`, `create_occlusion_query` |
//! | Occlusion        | `begin/end_occlusion_query`, `draw_occlusion_boxes`, `read_occlusion_query` |
//! | Pass state       | `set_render_target`, `clear`, `set_viewport`, `set_scissor` |
//! | Pipeline state   | `bind_shaders`, `set_blend_mode`, `set_uniforms`          |
//! | Draws            | `draw_indexed_primitives`, `draw_fullscreen_quad`, `draw_shadow_depth` |
//!
//! [`recording::RecordingDevice`] is an in-memory implementation that logs
//! every call; the test suite runs against it.

pub mod recording;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::math::bounds::Aabb;
use crate::renderer::shadows::depth::DepthShaderFlags;
use crate::renderer::shadows::pcf::PcfPermutation;
use crate::settings::GpuCapabilities;

// ============================================================================
// Handles
// ============================================================================

macro_rules! device_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            pub struct $name(pub u32);
        )*
    };
}

device_handle!(
    /// A texture or render target.
    TextureHandle,
    SamplerHandle,
    /// One GPU occlusion query.
    QueryHandle,
    /// Vertex and index buffers of a drawable mesh, owned by the host.
    MeshHandle,
);

// ============================================================================
// Resource descriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureDimension {
    D2,
    /// Six square faces.
    Cube,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub dimension: TextureDimension,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

impl TextureDesc {
    /// Depth render target that is later sampled by projection.
    #[must_use]
    pub fn shadow_depth(label: &'static str, width: u32, height: u32) -> Self {
        Self {
            label,
            width,
            height,
            dimension: TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        }
    }

    /// Small sampled texture filled from the CPU.
    #[must_use]
    pub fn lookup(label: &'static str, width: u32, height: u32, format: wgpu::TextureFormat) -> Self {
        Self {
            label,
            width,
            height,
            dimension: TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        }
    }

    #[must_use]
    pub fn shadow_cube(label: &'static str, size: u32) -> Self {
        Self {
            dimension: TextureDimension::Cube,
            ..Self::shadow_depth(label, size, size)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: wgpu::FilterMode,
    pub address: wgpu::AddressMode,
    /// Set for comparison (hardware PCF) samplers.
    pub compare: Option<wgpu::CompareFunction>,
}

impl SamplerDesc {
    pub const POINT_CLAMP: Self = Self {
        filter: wgpu::FilterMode::Nearest,
        address: wgpu::AddressMode::ClampToEdge,
        compare: None,
    };

    pub const BILINEAR_WRAP: Self = Self {
        filter: wgpu::FilterMode::Linear,
        address: wgpu::AddressMode::Repeat,
        compare: None,
    };

    pub const COMPARE_LESS: Self = Self {
        filter: wgpu::FilterMode::Linear,
        address: wgpu::AddressMode::ClampToEdge,
        compare: Some(wgpu::CompareFunction::Less),
    };
}

// ============================================================================
// Pass and pipeline state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// What the next draws render into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTargetBinding {
    /// Depth-only pass into a 2D atlas.
    ShadowDepth(TextureHandle),
    /// Depth-only pass into one face of a cube map.
    CubeFace { texture: TextureHandle, face: u8 },
    /// Depth-only pass into all six faces; the geometry stage picks the face.
    CubeLayered(TextureHandle),
    /// The host's scene color (modulated shadows) or attenuation buffer.
    SceneColor,
    LightAttenuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexShader {
    OcclusionBounds,
    ShadowDepth(DepthShaderFlags),
    ScreenQuad,
    /// Forward projection draws receivers with their own geometry.
    ProjectionReceiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelShader {
    /// Alpha-tested depth output.
    ShadowDepthMasked,
    ShadowProjection(PcfPermutation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryShader {
    /// Emits every triangle once per cube face.
    CubeAmplify,
}

/// A bound shader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderState {
    pub vertex: VertexShader,
    pub pixel: Option<PixelShader>,
    pub geometry: Option<GeometryShader>,
    /// Faces culled by the rasterizer; `None` draws both sides.
    pub cull_mode: Option<wgpu::Face>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// `dst = min(dst, src)`; attenuation from several shadows combines.
    MinAttenuation,
    /// `dst = dst * src`; modulated shadows darken lit color.
    Modulate,
}

/// Uniform blocks the device receives as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformSlot {
    /// Per draw: world-to-shadow of one depth draw.
    Object,
    /// Per shadow: depth pass parameters.
    ShadowDepth,
    /// Per shadow and view: projection parameters.
    ShadowProjection,
    /// Per cube shadow: the six face matrices.
    CubeFaces,
}

/// Per-draw block written by the default [`RenderDevice::draw_shadow_depth`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectUniforms {
    pub world_to_shadow: [[f32; 4]; 4],
}

// ============================================================================
// RenderDevice
// ============================================================================

/// The operations the shadow pipeline needs from a GPU.
pub trait RenderDevice: Send {
    fn capabilities(&self) -> GpuCapabilities;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle>;
    fn destroy_texture(&mut self, texture: TextureHandle);
    /// Uploads the full contents of a texture, tightly packed rows.
    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]);
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle>;
    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    fn create_occlusion_query(&mut self) -> Result<QueryHandle>;
    fn destroy_occlusion_query(&mut self, query: QueryHandle);
    fn begin_occlusion_query(&mut self, query: QueryHandle);
    fn end_occlusion_query(&mut self, query: QueryHandle);
    /// Rasterizes boxes with depth test on and all writes off.
    fn draw_occlusion_boxes(&mut self, boxes: &[Aabb]);
    /// Pixels that passed the depth test, `None` while still pending.
    /// With `wait` set the call blocks until the result is available.
    fn read_occlusion_query(&mut self, query: QueryHandle, wait: bool) -> Option<u64>;

    fn set_render_target(&mut self, target: RenderTargetBinding);
    fn clear_depth(&mut self, depth: f32);
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_scissor(&mut self, scissor: Option<ScissorRect>);

    fn bind_shaders(&mut self, shaders: &ShaderState);
    fn set_blend_mode(&mut self, mode: BlendMode);
    fn set_uniforms(&mut self, slot: UniformSlot, data: &[u8]);
    /// Binds a texture for sampling by the projection shader.
    fn bind_texture(&mut self, slot: u32, texture: TextureHandle, sampler: SamplerHandle);

    fn draw_indexed_primitives(&mut self, mesh: MeshHandle, instance_count: u32);
    fn draw_fullscreen_quad(&mut self);

    /// Draws `mesh` into the bound depth target.
    fn draw_shadow_depth(&mut self, mesh: MeshHandle, world_to_shadow: &Mat4) {
        let uniforms = ObjectUniforms {
            world_to_shadow: world_to_shadow.to_cols_array_2d(),
        };
        self.set_uniforms(UniformSlot::Object, bytemuck::bytes_of(&uniforms));
        self.draw_indexed_primitives(mesh, 1);
    }

    /// Blocks until all submitted GPU work has finished.
    fn wait_for_idle(&mut self) {}
}

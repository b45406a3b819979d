//! In-memory [`RenderDevice`] that records every call.
//!
//! Occlusion queries are answered by a pixel oracle: a closure that receives
//! the boxes drawn between `begin_occlusion_query` and `end_occlusion_query`
//! and returns how many pixels would have passed.

use glam::Mat4;
use rustc_hash::FxHashMap;

use super::{
    BlendMode, MeshHandle, QueryHandle, RenderDevice, RenderTargetBinding, SamplerDesc,
    SamplerHandle, ScissorRect, ShaderState, TextureDesc, TextureHandle, UniformSlot,
    VertexShader, Viewport,
};
use crate::errors::Result;
use crate::math::bounds::Aabb;
use crate::settings::GpuCapabilities;

/// Decides how many pixels of a query's boxes are visible.
pub type PixelOracle = Box<dyn FnMut(&[Aabb]) -> u64 + Send>;

/// One recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    CreateTexture(TextureHandle, TextureDesc),
    DestroyTexture(TextureHandle),
    /// Texture and byte count.
    WriteTexture(TextureHandle, usize),
    CreateSampler(SamplerHandle, SamplerDesc),
    DestroySampler(SamplerHandle),
    CreateQuery(QueryHandle),
    DestroyQuery(QueryHandle),
    BeginQuery(QueryHandle),
    EndQuery(QueryHandle, u64),
    DrawOcclusionBoxes(usize),
    ReadQuery(QueryHandle, Option<u64>),
    SetRenderTarget(RenderTargetBinding),
    ClearDepth(f32),
    SetViewport(Viewport),
    SetScissor(Option<ScissorRect>),
    BindShaders(ShaderState),
    SetBlendMode(BlendMode),
    SetUniforms(UniformSlot, usize),
    BindTexture(u32, TextureHandle, SamplerHandle),
    DrawIndexed(MeshHandle, u32),
    DrawShadowDepth(MeshHandle, Mat4),
    DrawFullscreenQuad,
    WaitForIdle,
}

pub struct RecordingDevice {
    capabilities: GpuCapabilities,
    calls: Vec<DeviceCall>,
    next_handle: u32,
    live_textures: FxHashMap<TextureHandle, TextureDesc>,
    live_queries: FxHashMap<QueryHandle, Option<u64>>,
    open_query: Option<(QueryHandle, Vec<Aabb>)>,
    oracle: PixelOracle,
    shaders: Option<ShaderState>,
    depth_draws: usize,
    projection_draws: usize,
}

impl std::fmt::Debug for RecordingDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingDevice")
            .field("capabilities", &self.capabilities)
            .field("calls", &self.calls.len())
            .field("depth_draws", &self.depth_draws)
            .field("projection_draws", &self.projection_draws)
            .finish_non_exhaustive()
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new(GpuCapabilities::default())
    }
}

impl RecordingDevice {
    /// A device whose queries always report 1000 visible pixels.
    #[must_use]
    pub fn new(capabilities: GpuCapabilities) -> Self {
        Self {
            capabilities,
            calls: Vec::new(),
            next_handle: 1,
            live_textures: FxHashMap::default(),
            live_queries: FxHashMap::default(),
            open_query: None,
            oracle: Box::new(|_| 1000),
            shaders: None,
            depth_draws: 0,
            projection_draws: 0,
        }
    }

    #[must_use]
    pub fn with_oracle(mut self, oracle: impl FnMut(&[Aabb]) -> u64 + Send + 'static) -> Self {
        self.oracle = Box::new(oracle);
        self
    }

    pub fn set_oracle(&mut self, oracle: impl FnMut(&[Aabb]) -> u64 + Send + 'static) {
        self.oracle = Box::new(oracle);
    }

    #[must_use]
    pub fn calls(&self) -> &[DeviceCall] {
        &self.calls
    }

    /// Clears the call log and draw counters; live resources are kept.
    pub fn reset_log(&mut self) {
        self.calls.clear();
        self.depth_draws = 0;
        self.projection_draws = 0;
    }

    /// Draws issued while a shadow depth shader was bound.
    #[must_use]
    pub fn depth_draw_count(&self) -> usize {
        self.depth_draws
    }

    /// Draws issued while a projection shader was bound.
    #[must_use]
    pub fn projection_draw_count(&self) -> usize {
        self.projection_draws
    }

    #[must_use]
    pub fn live_texture_count(&self) -> usize {
        self.live_textures.len()
    }

    #[must_use]
    pub fn live_query_count(&self) -> usize {
        self.live_queries.len()
    }

    fn next(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn count_draw(&mut self) {
        match self.shaders.map(|s| s.vertex) {
            Some(VertexShader::ShadowDepth(_)) => self.depth_draws += 1,
            Some(VertexShader::ScreenQuad | VertexShader::ProjectionReceiver) => {
                self.projection_draws += 1;
            }
            _ => {}
        }
    }
}

impl RenderDevice for RecordingDevice {
    fn capabilities(&self) -> GpuCapabilities {
        self.capabilities
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle> {
        let handle = TextureHandle(self.next());
        self.live_textures.insert(handle, desc.clone());
        self.calls.push(DeviceCall::CreateTexture(handle, desc.clone()));
        Ok(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.live_textures.remove(&texture);
        self.calls.push(DeviceCall::DestroyTexture(texture));
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]) {
        self.calls.push(DeviceCall::WriteTexture(texture, data.len()));
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        let handle = SamplerHandle(self.next());
        self.calls.push(DeviceCall::CreateSampler(handle, *desc));
        Ok(handle)
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.calls.push(DeviceCall::DestroySampler(sampler));
    }

    fn create_occlusion_query(&mut self) -> Result<QueryHandle> {
        let handle = QueryHandle(self.next());
        self.live_queries.insert(handle, None);
        self.calls.push(DeviceCall::CreateQuery(handle));
        Ok(handle)
    }

    fn destroy_occlusion_query(&mut self, query: QueryHandle) {
        self.live_queries.remove(&query);
        self.calls.push(DeviceCall::DestroyQuery(query));
    }

    fn begin_occlusion_query(&mut self, query: QueryHandle) {
        self.open_query = Some((query, Vec::new()));
        self.calls.push(DeviceCall::BeginQuery(query));
    }

    fn end_occlusion_query(&mut self, query: QueryHandle) {
        let boxes = match self.open_query.take() {
            Some((open, boxes)) if open == query => boxes,
            _ => Vec::new(),
        };
        let pixels = (self.oracle)(&boxes);
        self.live_queries.insert(query, Some(pixels));
        self.calls.push(DeviceCall::EndQuery(query, pixels));
    }

    fn draw_occlusion_boxes(&mut self, boxes: &[Aabb]) {
        if let Some((_, open)) = self.open_query.as_mut() {
            open.extend_from_slice(boxes);
        }
        self.calls.push(DeviceCall::DrawOcclusionBoxes(boxes.len()));
    }

    fn read_occlusion_query(&mut self, query: QueryHandle, _wait: bool) -> Option<u64> {
        let result = self.live_queries.get(&query).copied().flatten();
        self.calls.push(DeviceCall::ReadQuery(query, result));
        result
    }

    fn set_render_target(&mut self, target: RenderTargetBinding) {
        self.calls.push(DeviceCall::SetRenderTarget(target));
    }

    fn clear_depth(&mut self, depth: f32) {
        self.calls.push(DeviceCall::ClearDepth(depth));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.calls.push(DeviceCall::SetViewport(viewport));
    }

    fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        self.calls.push(DeviceCall::SetScissor(scissor));
    }

    fn bind_shaders(&mut self, shaders: &ShaderState) {
        self.shaders = Some(*shaders);
        self.calls.push(DeviceCall::BindShaders(*shaders));
    }

    fn set_blend_mode(&mut self, mode: BlendMode) {
        self.calls.push(DeviceCall::SetBlendMode(mode));
    }

    fn set_uniforms(&mut self, slot: UniformSlot, data: &[u8]) {
        self.calls.push(DeviceCall::SetUniforms(slot, data.len()));
    }

    fn bind_texture(&mut self, slot: u32, texture: TextureHandle, sampler: SamplerHandle) {
        self.calls.push(DeviceCall::BindTexture(slot, texture, sampler));
    }

    fn draw_indexed_primitives(&mut self, mesh: MeshHandle, instance_count: u32) {
        self.count_draw();
        self.calls.push(DeviceCall::DrawIndexed(mesh, instance_count));
    }

    fn draw_fullscreen_quad(&mut self) {
        self.count_draw();
        self.calls.push(DeviceCall::DrawFullscreenQuad);
    }

    fn draw_shadow_depth(&mut self, mesh: MeshHandle, world_to_shadow: &Mat4) {
        self.count_draw();
        self.calls.push(DeviceCall::DrawShadowDepth(mesh, *world_to_shadow));
    }

    fn wait_for_idle(&mut self) {
        self.calls.push(DeviceCall::WaitForIdle);
    }
}

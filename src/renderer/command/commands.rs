use std::fmt;
use std::sync::Arc;

use glam::{Vec3, Vec4};

use super::fence::FenceSignal;
use super::thread::{RenderContext, Tickable};
use crate::math::bounds::BoxSphereBounds;
use crate::scene::primitive::StaticMeshDesc;
use crate::scene::{LightDesc, LightId, PrimitiveDesc, PrimitiveId, ViewDesc};
use crate::settings::ShadowSettings;

/// Arbitrary work run on the render thread with full access to its state.
pub type RenderTask = Box<dyn FnOnce(&mut RenderContext) + Send>;

/// One message from the scene thread to the render thread.
pub enum RenderCommand {
    AddPrimitive(PrimitiveDesc),
    RemovePrimitive(PrimitiveId),
    UpdatePrimitiveTransform {
        id: PrimitiveId,
        bounds: BoxSphereBounds,
    },
    AddLight(LightDesc),
    RemoveLight(LightId),
    UpdateLightTransform {
        id: LightId,
        position: Vec3,
        direction: Vec3,
    },
    UpdateLightColorAndBrightness {
        id: LightId,
        color: Vec3,
        brightness: f32,
    },
    UpdateModShadowColor {
        id: LightId,
        color: Vec4,
    },
    AttachLightEnvironment {
        primitive: PrimitiveId,
        lights: Vec<LightId>,
    },
    SetSettings(Arc<ShadowSettings>),
    RenderFrame {
        views: Vec<ViewDesc>,
        /// Seconds since start.
        now: f32,
    },
    AddTickable(Box<dyn Tickable>),
    Execute(RenderTask),
    /// Signals once every earlier command has executed.
    Fence(FenceSignal),
    /// Waits for the GPU, frees deferred cleanup objects, then signals.
    Flush(FenceSignal),
    /// Drains what is left and ends the render thread.
    Stop,
}

impl RenderCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddPrimitive(_) => "AddPrimitive",
            Self::RemovePrimitive(_) => "RemovePrimitive",
            Self::UpdatePrimitiveTransform { .. } => "UpdatePrimitiveTransform",
            Self::AddLight(_) => "AddLight",
            Self::RemoveLight(_) => "RemoveLight",
            Self::UpdateLightTransform { .. } => "UpdateLightTransform",
            Self::UpdateLightColorAndBrightness { .. } => "UpdateLightColorAndBrightness",
            Self::UpdateModShadowColor { .. } => "UpdateModShadowColor",
            Self::AttachLightEnvironment { .. } => "AttachLightEnvironment",
            Self::SetSettings(_) => "SetSettings",
            Self::RenderFrame { .. } => "RenderFrame",
            Self::AddTickable(_) => "AddTickable",
            Self::Execute(_) => "Execute",
            Self::Fence(_) => "Fence",
            Self::Flush(_) => "Flush",
            Self::Stop => "Stop",
        }
    }

    /// Bytes the command occupies in the ring: the inline enum plus its
    /// heap payload.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        let payload = match self {
            Self::AddPrimitive(desc) => desc.static_meshes.len() * size_of::<StaticMeshDesc>(),
            Self::AttachLightEnvironment { lights, .. } => lights.len() * size_of::<LightId>(),
            Self::RenderFrame { views, .. } => views.len() * size_of::<ViewDesc>(),
            Self::SetSettings(_) => size_of::<ShadowSettings>(),
            _ => 0,
        };
        size_of::<Self>() + payload
    }
}

impl fmt::Debug for RenderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderCommand")
            .field("name", &self.name())
            .field("size", &self.encoded_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::MeshHandle;

    #[test]
    fn payload_counts_towards_size() {
        let bounds = BoxSphereBounds::from_sphere(Vec3::ZERO, 1.0);
        let mut desc = PrimitiveDesc::static_mesh(bounds, MeshHandle(1));
        let one = RenderCommand::AddPrimitive(desc.clone()).encoded_size();
        desc.static_meshes.push(StaticMeshDesc::new(MeshHandle(2)));
        let two = RenderCommand::AddPrimitive(desc).encoded_size();
        assert_eq!(two - one, size_of::<StaticMeshDesc>());
        assert_eq!(RenderCommand::Stop.encoded_size(), size_of::<RenderCommand>());
    }
}

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::doc_markdown)]

//! Dynamic shadow scheduling and projection.
//!
//! Per frame the [`Renderer`] decides which shadows exist, packs their depth
//! maps into atlases, renders them and projects them onto the views, all
//! through the opaque [`rhi::RenderDevice`] contract. Scene changes reach the
//! render thread only as commands through the
//! [`renderer::command`] ring.

pub mod errors;
pub mod math;
pub mod renderer;
pub mod rhi;
pub mod scene;
pub mod settings;

pub use errors::{Result, ShadowError};
pub use renderer::command::{RenderCommand, RenderContext, RenderFence, RenderingThread};
pub use renderer::shadows::{ProjectedShadow, ShadowKind, ShadowState};
pub use renderer::{FrameReport, Renderer, WarnOnce};
pub use rhi::RenderDevice;
pub use rhi::recording::RecordingDevice;
pub use scene::{
    LightDesc, LightId, PrimitiveDesc, PrimitiveId, Scene, ViewDesc, ViewInfo, ViewStateId,
};
pub use settings::{GpuCapabilities, ShadowSettings};

//! Render Command Ring
//!
//! Scene mutation happens on the caller's thread; rendering happens on a
//! dedicated render thread. The two share nothing but a FIFO ring of
//! [`RenderCommand`]s, completion fences and a health flag.
//!
//! ```text
//! scene thread                         render thread
//! ────────────                         ─────────────
//! enqueue(AddPrimitive) ──┐
//! enqueue(AddLight)     ──┼── ring ──► execute in order
//! fence() / wait()      ──┘            fire fence signal
//! ```

pub mod commands;
pub mod fence;
pub mod ring;
pub mod thread;

pub use commands::{RenderCommand, RenderTask};
pub use fence::{FenceSignal, RenderFence};
pub use ring::{
    CommandConsumer, CommandProducer, RENDERING_COMMAND_BUFFER_SIZE, RingRead, command_ring,
};
pub use thread::{
    DeferredCleanup, RenderContext, RenderThreadHealth, RenderingThread, SuspendGuard, Tickable,
};

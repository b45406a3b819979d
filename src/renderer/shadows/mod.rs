//! Dynamic Shadows
//!
//! Per-frame pipeline, in order:
//!
//! - [`setup`]: decide which shadows exist, their resolutions and fades
//! - [`gather`]: fill subject and receiver lists from the octree
//! - [`preshadow_cache`]: reuse or pack cacheable preshadows
//! - [`atlas`]: place the rest in transient atlases, pass by pass
//! - [`depth`]: render subject depths into each rectangle
//! - [`projection`]: filter with a [`pcf`] permutation and composite
//!
//! Supporting pieces: [`initializer`] and [`projected`] hold the projection
//! math, [`cascades`] splits directional lights, [`fade`] computes alphas,
//! [`texture_layout`] packs rectangles.

pub mod atlas;
pub mod cascades;
pub mod depth;
pub mod fade;
pub mod gather;
pub mod initializer;
pub mod pcf;
pub mod preshadow_cache;
pub mod projected;
pub mod projection;
pub mod setup;
pub mod texture_layout;

pub use atlas::{CubeShadowAtlas, ShadowAtlas};
pub use gather::{GatherStats, gather_shadow_primitives};
pub use initializer::ProjectedShadowInitializer;
pub use pcf::{PcfHardware, PcfPermutation};
pub use preshadow_cache::{PreshadowCache, PreshadowKey, update_preshadow_cache};
pub use projected::{AtlasKind, ProjectedShadow, ShadowKind, ShadowState, ShadowTarget};
pub use setup::{
    SetupContext, ShadowFrame, ShadowFrameStats, compute_shadow_visibility, init_dynamic_shadows,
};
pub use texture_layout::{LayoutRect, TextureLayout};

//! Scene Module
//!
//! Render-side records of everything the shadow pipeline reads:
//!
//! - [`LightSceneInfo`]: a light plus its shadow-casting parameters
//! - [`PrimitiveSceneInfo`]: a renderable with bounds, flags and static meshes
//! - [`LightPrimitiveInteraction`]: one edge of the light/primitive graph
//! - [`PrimitiveOctree`]: loose octree used by the shadow gatherer
//! - [`ViewDesc`] / [`ViewInfo`]: per-frame camera input and its derived state
//! - [`Scene`]: owner of all of the above
//!
//! # Identity
//!
//! Two kinds of handle coexist. Component ids ([`LightId`], [`PrimitiveId`])
//! are chosen by the scene thread and stay stable for the lifetime of the
//! component; they are what commands and the preshadow cache refer to.
//! Slot keys ([`LightKey`], [`PrimitiveKey`]) index the render-side arenas
//! and are invalidated when the record is removed.

pub mod interaction;
pub mod light;
pub mod octree;
pub mod primitive;
#[allow(clippy::module_inception)]
pub mod scene;
pub mod view;

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

pub use interaction::LightPrimitiveInteraction;
pub use light::{
    LightDesc, LightFlags, LightSceneInfo, LightType, LightingChannels, ShadowFilterQuality,
    ShadowProjectionMode,
};
pub use octree::PrimitiveOctree;
pub use primitive::{
    PrimitiveDesc, PrimitiveFlags, PrimitiveRelevance, PrimitiveSceneInfo, StaticMeshDesc,
    StaticMeshId,
};
pub use scene::Scene;
pub use view::{ShowFlags, ViewDesc, ViewInfo, ViewStateId};

new_key_type! {
    pub struct LightKey;
    pub struct PrimitiveKey;
}

macro_rules! component_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        static $counter: AtomicU32 = AtomicU32::new(1);

        impl $name {
            /// Allocates a process-unique id.
            #[must_use]
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }
        }
    };
}

component_id!(
    /// Stable id of a light component.
    LightId,
    NEXT_LIGHT_ID
);

component_id!(
    /// Stable id of a primitive component.
    PrimitiveId,
    NEXT_PRIMITIVE_ID
);

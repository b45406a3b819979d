//! Geometry shared by the shadow pipeline: bounds, convex volumes and the
//! matrix builders for shadow projections.

pub mod bounds;
pub mod frustum;
pub mod transforms;

pub use bounds::{Aabb, BoxSphereBounds, Sphere};
pub use frustum::ConvexVolume;
pub use transforms::{DELTA, HALF_WORLD_MAX, WORLD_MAX};

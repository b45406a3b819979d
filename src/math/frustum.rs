//! Convex Volumes
//!
//! Plane sets extracted from view-projection matrices, used for every
//! frustum test in the subsystem: view culling, shadow subject gathering,
//! receiver gathering and octree pruning.
//!
//! Planes are stored as `Vec4(n.x, n.y, n.z, d)` with normals pointing
//! inward, so a point is inside when `dot(n, p) + d >= 0` for every plane.

use glam::{Mat4, Vec3, Vec4};
use smallvec::SmallVec;

use super::bounds::{Aabb, BoxSphereBounds};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvexVolume {
    planes: SmallVec<[Vec4; 6]>,
}

impl ConvexVolume {
    /// Builds a volume from explicit planes, normalising each.
    #[must_use]
    pub fn from_planes(planes: impl IntoIterator<Item = Vec4>) -> Self {
        let planes = planes
            .into_iter()
            .filter_map(|p| {
                let len = p.truncate().length();
                (len > f32::EPSILON).then(|| p / len)
            })
            .collect();
        Self { planes }
    }

    /// Extracts the clip volume of a matrix mapping to clip space with
    /// depth in `[0, 1]` (Gribb-Hartmann).
    ///
    /// With `use_near_plane == false` the near plane is skipped; shadow
    /// frustums for directional lights start on the far side of the world
    /// and clamp to it instead of clipping.
    #[must_use]
    pub fn from_matrix(m: &Mat4, use_near_plane: bool) -> Self {
        let rows = [m.row(0), m.row(1), m.row(2), m.row(3)];

        let mut planes: SmallVec<[Vec4; 6]> = SmallVec::new();
        // Left / Right
        planes.push(rows[3] + rows[0]);
        planes.push(rows[3] - rows[0]);
        // Bottom / Top
        planes.push(rows[3] + rows[1]);
        planes.push(rows[3] - rows[1]);
        // Near (z >= 0)
        if use_near_plane {
            planes.push(rows[2]);
        }
        // Far (z <= w)
        planes.push(rows[3] - rows[2]);

        Self::from_planes(planes)
    }

    #[inline]
    #[must_use]
    pub fn planes(&self) -> &[Vec4] {
        &self.planes
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn contains_point(&self, p: Vec3) -> bool {
        self.planes.iter().all(|pl| pl.truncate().dot(p) + pl.w >= 0.0)
    }

    #[must_use]
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        for plane in &self.planes {
            let dist = plane.truncate().dot(center) + plane.w;
            if dist < -radius {
                return false;
            }
        }
        true
    }

    /// Conservative box test: rejects only when the box lies entirely on
    /// the outside of one plane.
    #[must_use]
    pub fn intersects_box(&self, origin: Vec3, extent: Vec3) -> bool {
        for plane in &self.planes {
            let n = plane.truncate();
            let dist = n.dot(origin) + plane.w;
            let push_out = n.abs().dot(extent);
            if dist < -push_out {
                return false;
            }
        }
        true
    }

    #[inline]
    #[must_use]
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.intersects_box(aabb.center(), aabb.extent())
    }

    /// Sphere test first (cheap), then box.
    #[inline]
    #[must_use]
    pub fn intersects_bounds(&self, bounds: &BoxSphereBounds) -> bool {
        self.intersects_sphere(bounds.origin, bounds.sphere_radius)
            && self.intersects_box(bounds.origin, bounds.box_extent)
    }

    /// Translates every plane by `offset` (the volume moves by `offset`).
    #[must_use]
    pub fn translated(&self, offset: Vec3) -> Self {
        Self {
            planes: self
                .planes
                .iter()
                .map(|p| Vec4::new(p.x, p.y, p.z, p.w - p.truncate().dot(offset)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ortho_unit() -> Mat4 {
        Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.0, 10.0)
    }

    #[test]
    fn ortho_contains_center() {
        let v = ConvexVolume::from_matrix(&ortho_unit(), true);
        assert!(v.contains_point(Vec3::new(0.0, 0.0, -5.0)));
        assert!(!v.contains_point(Vec3::new(0.0, 0.0, 5.0)));
        assert!(!v.contains_point(Vec3::new(2.0, 0.0, -5.0)));
    }

    #[test]
    fn skipping_near_plane_accepts_points_behind() {
        let v = ConvexVolume::from_matrix(&ortho_unit(), false);
        assert!(v.contains_point(Vec3::new(0.0, 0.0, 5.0)));
    }

    #[test]
    fn box_straddling_plane_intersects() {
        let v = ConvexVolume::from_matrix(&ortho_unit(), true);
        assert!(v.intersects_box(Vec3::new(1.5, 0.0, -5.0), Vec3::splat(0.6)));
        assert!(!v.intersects_box(Vec3::new(1.5, 0.0, -5.0), Vec3::splat(0.4)));
    }

    #[test]
    fn translation_moves_volume() {
        let v = ConvexVolume::from_matrix(&ortho_unit(), true).translated(Vec3::new(10.0, 0.0, 0.0));
        assert!(v.contains_point(Vec3::new(10.0, 0.0, -5.0)));
        assert!(!v.contains_point(Vec3::new(0.0, 0.0, -5.0)));
    }
}

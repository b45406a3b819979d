//! Bounding Volumes
//!
//! Axis-aligned boxes, spheres and the combined box/sphere bounds carried by
//! every primitive and light.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

// ============================================================================
// Aabb
// ============================================================================

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// An inverted box that any `expand_to_include` call will overwrite.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    #[inline]
    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[inline]
    #[must_use]
    pub fn from_center_extent(center: Vec3, extent: Vec3) -> Self {
        Self {
            min: center - extent,
            max: center + extent,
        }
    }

    #[inline]
    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    #[must_use]
    pub fn extent(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    #[inline]
    pub fn expand_to_include(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    #[inline]
    #[must_use]
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    #[inline]
    #[must_use]
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Returns the eight corners, indexed by `x | y << 1 | z << 2`
    /// (bit set = max side).
    #[must_use]
    pub fn corners(&self) -> [Vec3; 8] {
        let mut out = [Vec3::ZERO; 8];
        for (i, corner) in out.iter_mut().enumerate() {
            *corner = Vec3::new(
                if i & 1 != 0 { self.max.x } else { self.min.x },
                if i & 2 != 0 { self.max.y } else { self.min.y },
                if i & 4 != 0 { self.max.z } else { self.min.z },
            );
        }
        out
    }

    /// Transforms the eight corners by `m` (no perspective divide) and
    /// returns the box around the results.
    #[must_use]
    pub fn transform_by(&self, m: &Mat4) -> Aabb {
        let mut out = Aabb::EMPTY;
        for c in self.corners() {
            out.expand_to_include((*m * c.extend(1.0)).truncate());
        }
        out
    }

    /// Like [`transform_by`](Self::transform_by) but divides by `w`.
    #[must_use]
    pub fn project_by(&self, m: &Mat4) -> Aabb {
        let mut out = Aabb::EMPTY;
        for c in self.corners() {
            out.expand_to_include(m.project_point3(c));
        }
        out
    }
}

/// The twelve edges of a box, as index pairs into [`Aabb::corners`].
pub const BOX_EDGES: [(usize, usize); 12] = [
    // X edges
    (0, 1),
    (2, 3),
    (4, 5),
    (6, 7),
    // Y edges
    (0, 2),
    (1, 3),
    (4, 6),
    (5, 7),
    // Z edges
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

// ============================================================================
// Sphere
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    #[inline]
    #[must_use]
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Whether `self` lies entirely inside `other` grown by `tolerance`.
    #[inline]
    #[must_use]
    pub fn is_inside(&self, other: &Sphere, tolerance: f32) -> bool {
        if self.radius > other.radius + tolerance {
            return false;
        }
        let slack = other.radius + tolerance - self.radius;
        self.center.distance_squared(other.center) <= slack * slack
    }

    #[inline]
    #[must_use]
    pub fn intersects(&self, other: &Sphere) -> bool {
        let r = self.radius + other.radius;
        self.center.distance_squared(other.center) <= r * r
    }
}

// ============================================================================
// BoxSphereBounds
// ============================================================================

/// Combined box and sphere bounds sharing one origin.
///
/// The box is the tight fit; the sphere is rotation invariant and is what
/// screen-size and cache-containment tests use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxSphereBounds {
    pub origin: Vec3,
    pub box_extent: Vec3,
    pub sphere_radius: f32,
}

impl BoxSphereBounds {
    #[inline]
    #[must_use]
    pub fn new(origin: Vec3, box_extent: Vec3, sphere_radius: f32) -> Self {
        Self {
            origin,
            box_extent,
            sphere_radius,
        }
    }

    /// Bounds of an axis-aligned box; the sphere circumscribes it.
    #[must_use]
    pub fn from_box(aabb: &Aabb) -> Self {
        let extent = aabb.extent();
        Self::new(aabb.center(), extent, extent.length())
    }

    /// Bounds of a sphere; the box circumscribes it.
    #[must_use]
    pub fn from_sphere(center: Vec3, radius: f32) -> Self {
        Self::new(center, Vec3::splat(radius), radius)
    }

    #[inline]
    #[must_use]
    pub fn aabb(&self) -> Aabb {
        Aabb::from_center_extent(self.origin, self.box_extent)
    }

    #[inline]
    #[must_use]
    pub fn sphere(&self) -> Sphere {
        Sphere::new(self.origin, self.sphere_radius)
    }

    #[inline]
    #[must_use]
    pub fn translated(&self, offset: Vec3) -> Self {
        Self {
            origin: self.origin + offset,
            ..*self
        }
    }

    /// Pads the bounds by `fraction` of their own size.
    ///
    /// The radius grows by `|extent| * fraction` and the extent by
    /// `1 + fraction`, so the grown sphere still circumscribes the grown box.
    #[must_use]
    pub fn expand_by_fraction(&self, fraction: f32) -> Self {
        Self {
            origin: self.origin,
            box_extent: self.box_extent * (1.0 + fraction),
            sphere_radius: self.sphere_radius + (self.box_extent * fraction).length(),
        }
    }

    /// Smallest bounds containing both inputs.
    #[must_use]
    pub fn union(&self, other: &BoxSphereBounds) -> Self {
        let mut aabb = self.aabb();
        let other_box = other.aabb();
        aabb.expand_to_include(other_box.min);
        aabb.expand_to_include(other_box.max);

        let origin = aabb.center();
        let radius = (self.origin.distance(origin) + self.sphere_radius)
            .max(other.origin.distance(origin) + other.sphere_radius);
        Self::new(origin, aabb.extent(), radius.min(aabb.extent().length()))
    }

    /// Bounds after an affine transform: box re-fit from corners, sphere
    /// scaled by the largest axis scale.
    #[must_use]
    pub fn transform_by(&self, m: &Mat4) -> Self {
        let aabb = self.aabb().transform_by(m);
        let scale = m
            .x_axis
            .truncate()
            .length()
            .max(m.y_axis.truncate().length())
            .max(m.z_axis.truncate().length());
        Self::new(
            m.transform_point3(self.origin),
            aabb.extent(),
            self.sphere_radius * scale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corner_indexing_matches_bits() {
        let b = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let c = b.corners();
        assert_eq!(c[0], Vec3::splat(-1.0));
        assert_eq!(c[7], Vec3::splat(1.0));
        assert_eq!(c[1], Vec3::new(1.0, -1.0, -1.0));
        assert_eq!(c[4], Vec3::new(-1.0, -1.0, 1.0));
    }

    #[test]
    fn every_edge_differs_in_one_axis() {
        let b = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let c = b.corners();
        for (a, z) in BOX_EDGES {
            let d = (c[z] - c[a]).abs();
            assert!((d.x + d.y + d.z - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn sphere_inside_with_tolerance() {
        let cached = Sphere::new(Vec3::ZERO, 10.0);
        let live = Sphere::new(Vec3::new(0.3, 0.0, 0.0), 10.0);
        assert!(!live.is_inside(&cached, 0.0));
        assert!(live.is_inside(&cached, 0.4));
    }

    #[test]
    fn union_covers_both() {
        let a = BoxSphereBounds::from_sphere(Vec3::ZERO, 1.0);
        let b = BoxSphereBounds::from_sphere(Vec3::new(4.0, 0.0, 0.0), 1.0);
        let u = a.union(&b);
        assert!(a.sphere().is_inside(&u.sphere(), 1e-4));
        assert!(b.sphere().is_inside(&u.sphere(), 1e-4));
    }
}

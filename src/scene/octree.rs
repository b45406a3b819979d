//! Loose Octree
//!
//! Spatial index over primitive bounds. Nodes live in a flat arena and
//! refer to their children by index; an element is stored in the deepest
//! node whose *loose* box (twice the node's tight extent) still contains it,
//! so elements never straddle siblings and each one lives in exactly one
//! node.
//!
//! ```text
//!   tight box        loose box (2x)
//!   ┌──────┐      ┌──────────────┐
//!   │  ●   │      │   ┌──────┐   │
//!   └──────┘      │   │  ●───┼─┐ │   element fits if its centre is inside
//!                 │   └──────┘ │ │   the tight box and its extent is no
//!                 │            └─┘   larger than the tight extent
//!                 └──────────────┘
//! ```

use glam::Vec3;
use rustc_hash::FxHashMap;

use super::PrimitiveKey;
use crate::math::bounds::BoxSphereBounds;
use crate::math::transforms::HALF_WORLD_MAX;

const MAX_ELEMENTS_PER_LEAF: usize = 16;
const MIN_NODE_EXTENT: f32 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OctreeElement {
    pub primitive: PrimitiveKey,
    pub bounds: BoxSphereBounds,
}

#[derive(Debug, Clone)]
struct OctreeNode {
    center: Vec3,
    extent: f32,
    /// Arena indices of the eight children, once split.
    children: Option<[u32; 8]>,
    elements: Vec<OctreeElement>,
}

impl OctreeNode {
    fn new(center: Vec3, extent: f32) -> Self {
        Self {
            center,
            extent,
            children: None,
            elements: Vec::new(),
        }
    }

    #[inline]
    fn child_index(&self, p: Vec3) -> usize {
        usize::from(p.x > self.center.x)
            | usize::from(p.y > self.center.y) << 1
            | usize::from(p.z > self.center.z) << 2
    }

    #[inline]
    fn child_center(&self, index: usize) -> Vec3 {
        let h = self.extent * 0.5;
        let sign = |bit: usize| if index & bit != 0 { h } else { -h };
        self.center + Vec3::new(sign(1), sign(2), sign(4))
    }

    /// Whether an element fits a child of this node.
    #[inline]
    fn fits_child(&self, bounds: &BoxSphereBounds) -> bool {
        bounds.box_extent.max_element() <= self.extent * 0.5
    }
}

/// Loose octree indexed by [`PrimitiveKey`].
#[derive(Debug, Clone)]
pub struct PrimitiveOctree {
    nodes: Vec<OctreeNode>,
    locations: FxHashMap<PrimitiveKey, u32>,
}

impl Default for PrimitiveOctree {
    fn default() -> Self {
        Self::new(Vec3::ZERO, HALF_WORLD_MAX)
    }
}

impl PrimitiveOctree {
    #[must_use]
    pub fn new(center: Vec3, extent: f32) -> Self {
        Self {
            nodes: vec![OctreeNode::new(center, extent)],
            locations: FxHashMap::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    #[must_use]
    pub fn contains(&self, primitive: PrimitiveKey) -> bool {
        self.locations.contains_key(&primitive)
    }

    /// Inserts or moves `primitive`.
    pub fn insert(&mut self, primitive: PrimitiveKey, bounds: BoxSphereBounds) {
        self.remove(primitive);

        let mut index = 0u32;
        loop {
            let node = &self.nodes[index as usize];
            match node.children {
                Some(children) if node.fits_child(&bounds) => {
                    index = children[node.child_index(bounds.origin)];
                }
                _ => break,
            }
        }

        self.nodes[index as usize].elements.push(OctreeElement { primitive, bounds });
        self.locations.insert(primitive, index);
        self.split_if_needed(index);
    }

    /// Removes `primitive`, returning whether it was present.
    pub fn remove(&mut self, primitive: PrimitiveKey) -> bool {
        let Some(index) = self.locations.remove(&primitive) else {
            return false;
        };
        let elements = &mut self.nodes[index as usize].elements;
        if let Some(pos) = elements.iter().position(|e| e.primitive == primitive) {
            elements.swap_remove(pos);
        }
        true
    }

    fn split_if_needed(&mut self, index: u32) {
        let node = &self.nodes[index as usize];
        if node.children.is_some()
            || node.elements.len() <= MAX_ELEMENTS_PER_LEAF
            || node.extent * 0.5 < MIN_NODE_EXTENT
        {
            return;
        }

        let new_nodes: Vec<OctreeNode> = (0..8)
            .map(|i| OctreeNode::new(node.child_center(i), node.extent * 0.5))
            .collect();
        let base = self.nodes.len() as u32;
        let children: [u32; 8] = std::array::from_fn(|i| base + i as u32);
        self.nodes.extend(new_nodes);

        let parent = &mut self.nodes[index as usize];
        parent.children = Some(children);
        let elements = std::mem::take(&mut parent.elements);
        let (center, extent) = (parent.center, parent.extent);

        for element in elements {
            let node = OctreeNode::new(center, extent);
            let target = if node.fits_child(&element.bounds) {
                children[node.child_index(element.bounds.origin)]
            } else {
                index
            };
            self.nodes[target as usize].elements.push(element);
            self.locations.insert(element.primitive, target);
        }

        for child in children {
            self.split_if_needed(child);
        }
    }

    /// Depth-first traversal.
    ///
    /// `visit_node` receives each node's loose bounds and returns whether
    /// to descend; `visit_element` is called for every element of an
    /// accepted node.
    pub fn traverse(
        &self,
        mut visit_node: impl FnMut(&BoxSphereBounds) -> bool,
        mut visit_element: impl FnMut(&OctreeElement),
    ) {
        let mut stack = vec![0u32];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index as usize];
            let loose = node.extent * 2.0;
            let bounds =
                BoxSphereBounds::new(node.center, Vec3::splat(loose), loose * 3f32.sqrt());
            if !visit_node(&bounds) {
                continue;
            }
            node.elements.iter().for_each(&mut visit_element);
            if let Some(children) = node.children {
                stack.extend(children.iter().rev());
            }
        }
    }

    /// All elements, in traversal order.
    pub fn iter(&self) -> impl Iterator<Item = &OctreeElement> {
        self.nodes.iter().flat_map(|n| n.elements.iter())
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;

    fn keys(n: usize) -> Vec<PrimitiveKey> {
        let mut map: SlotMap<PrimitiveKey, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn split_keeps_every_element() {
        let mut octree = PrimitiveOctree::new(Vec3::ZERO, 1024.0);
        let keys = keys(100);
        for (i, &k) in keys.iter().enumerate() {
            let p = Vec3::new((i % 10) as f32 * 50.0 - 250.0, (i / 10) as f32 * 50.0 - 250.0, 0.0);
            octree.insert(k, BoxSphereBounds::from_sphere(p, 1.0));
        }
        assert_eq!(octree.len(), 100);
        assert_eq!(octree.iter().count(), 100);
        assert!(octree.nodes.len() > 1, "root should have split");
    }

    #[test]
    fn predicate_traversal_finds_matching_elements() {
        let mut octree = PrimitiveOctree::new(Vec3::ZERO, 1024.0);
        let keys = keys(40);
        for (i, &k) in keys.iter().enumerate() {
            let x = if i < 20 { -500.0 } else { 500.0 };
            octree.insert(k, BoxSphereBounds::from_sphere(Vec3::new(x, i as f32, 0.0), 1.0));
        }
        let mut seen = 0;
        octree.traverse(
            |b| b.origin.x + b.box_extent.x > 0.0,
            |e| {
                if e.bounds.origin.x > 0.0 {
                    seen += 1;
                }
            },
        );
        assert_eq!(seen, 20);
    }

    #[test]
    fn remove_then_reinsert_moves_element() {
        let mut octree = PrimitiveOctree::default();
        let k = keys(1)[0];
        octree.insert(k, BoxSphereBounds::from_sphere(Vec3::ZERO, 1.0));
        octree.insert(k, BoxSphereBounds::from_sphere(Vec3::splat(10.0), 1.0));
        assert_eq!(octree.len(), 1);
        assert_eq!(octree.iter().next().map(|e| e.bounds.origin), Some(Vec3::splat(10.0)));
        assert!(octree.remove(k));
        assert!(octree.is_empty());
    }
}

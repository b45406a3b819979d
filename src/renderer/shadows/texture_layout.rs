//! Texture Layout
//!
//! Guillotine bin packer over a fixed-size texture. Every node is either a
//! leaf (free or used) or split into two children along one axis:
//!
//! ```text
//!   +--------+-----------+        wider excess: split by column
//!   |  req   |           |        taller excess: split by row
//!   +--------+     B     |
//!   |   A'   |           |
//!   +--------+-----------+
//! ```
//!
//! Placement is a depth-first search that always tries the first child
//! before the second, so the same insertion sequence always produces the
//! same rectangles. Removing an element merges sibling leaves back together
//! once both are free.

/// A placed rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LayoutRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl LayoutRect {
    #[inline]
    #[must_use]
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline]
    #[must_use]
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &LayoutRect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, other: &LayoutRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

#[derive(Debug, Clone, Copy)]
struct LayoutNode {
    rect: LayoutRect,
    children: Option<(u32, u32)>,
    used: bool,
}

impl LayoutNode {
    fn leaf(rect: LayoutRect) -> Self {
        Self {
            rect,
            children: None,
            used: false,
        }
    }

    #[inline]
    fn is_free_leaf(&self) -> bool {
        self.children.is_none() && !self.used
    }
}

/// Online rectangle packer.
#[derive(Debug, Clone)]
pub struct TextureLayout {
    width: u32,
    height: u32,
    alignment: u32,
    nodes: Vec<LayoutNode>,
    free_nodes: Vec<u32>,
    element_count: usize,
    used_area: u64,
}

impl TextureLayout {
    /// An empty layout; requested sizes are rounded up to `alignment`.
    #[must_use]
    pub fn new(width: u32, height: u32, alignment: u32) -> Self {
        Self {
            width,
            height,
            alignment: alignment.max(1),
            nodes: vec![LayoutNode::leaf(LayoutRect::new(0, 0, width, height))],
            free_nodes: Vec::new(),
            element_count: 0,
            used_area: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    #[inline]
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Texels covered by placed elements, alignment padding included.
    #[inline]
    #[must_use]
    pub fn used_area(&self) -> u64 {
        self.used_area
    }

    #[inline]
    fn align(&self, value: u32) -> u32 {
        value.div_ceil(self.alignment) * self.alignment
    }

    /// Places a `width` x `height` element and returns its corner.
    pub fn add_element(&mut self, width: u32, height: u32) -> Option<(u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        let (width, height) = (self.align(width), self.align(height));
        if width > self.width || height > self.height {
            return None;
        }
        let node = self.add_surface(0, width, height)?;
        let node = &mut self.nodes[node];
        node.used = true;
        self.element_count += 1;
        self.used_area += node.rect.area();
        Some((node.rect.x, node.rect.y))
    }

    fn add_surface(&mut self, index: usize, width: u32, height: u32) -> Option<usize> {
        let node = self.nodes[index];
        if let Some((a, b)) = node.children {
            return self
                .add_surface(a as usize, width, height)
                .or_else(|| self.add_surface(b as usize, width, height));
        }
        if node.used || width > node.rect.width || height > node.rect.height {
            return None;
        }
        if width == node.rect.width && height == node.rect.height {
            return Some(index);
        }

        let r = node.rect;
        let (first, second) = if r.width - width > r.height - height {
            (
                LayoutRect::new(r.x, r.y, width, r.height),
                LayoutRect::new(r.x + width, r.y, r.width - width, r.height),
            )
        } else {
            (
                LayoutRect::new(r.x, r.y, r.width, height),
                LayoutRect::new(r.x, r.y + height, r.width, r.height - height),
            )
        };
        let a = self.alloc_node(first);
        let b = self.alloc_node(second);
        self.nodes[index].children = Some((a, b));
        self.add_surface(a as usize, width, height)
    }

    fn alloc_node(&mut self, rect: LayoutRect) -> u32 {
        let node = LayoutNode::leaf(rect);
        if let Some(index) = self.free_nodes.pop() {
            self.nodes[index as usize] = node;
            index
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    /// Frees an element placed by [`add_element`](Self::add_element) with
    /// the same arguments. Returns `false` when no such element exists.
    pub fn remove_element(&mut self, x: u32, y: u32, width: u32, height: u32) -> bool {
        let target = LayoutRect::new(x, y, self.align(width), self.align(height));
        let mut path = Vec::new();
        if !self.find_used(0, &target, &mut path) {
            return false;
        }

        let Some(&leaf) = path.last() else {
            return false;
        };
        self.nodes[leaf].used = false;
        self.element_count -= 1;
        self.used_area -= target.area();

        // Merge free siblings bottom-up.
        for &parent in path.iter().rev().skip(1) {
            let Some((a, b)) = self.nodes[parent].children else {
                break;
            };
            if !(self.nodes[a as usize].is_free_leaf() && self.nodes[b as usize].is_free_leaf()) {
                break;
            }
            self.nodes[parent].children = None;
            self.free_nodes.push(a);
            self.free_nodes.push(b);
        }
        true
    }

    fn find_used(&self, index: usize, target: &LayoutRect, path: &mut Vec<usize>) -> bool {
        let node = &self.nodes[index];
        if !node.rect.contains(target) {
            return false;
        }
        path.push(index);
        let found = match node.children {
            None => node.used && node.rect == *target,
            Some((a, b)) => {
                self.find_used(a as usize, target, path) || self.find_used(b as usize, target, path)
            }
        };
        if !found {
            path.pop();
        }
        found
    }

    /// Drops every element.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes
            .push(LayoutNode::leaf(LayoutRect::new(0, 0, self.width, self.height)));
        self.free_nodes.clear();
        self.element_count = 0;
        self.used_area = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_size_fits_only_when_empty() {
        let mut layout = TextureLayout::new(256, 256, 1);
        assert_eq!(layout.add_element(256, 256), Some((0, 0)));
        assert_eq!(layout.add_element(1, 1), None);
        assert!(layout.remove_element(0, 0, 256, 256));

        assert!(layout.add_element(16, 16).is_some());
        assert_eq!(layout.add_element(256, 256), None);
    }

    #[test]
    fn removal_merges_back_to_whole() {
        let mut layout = TextureLayout::new(128, 128, 1);
        let placed: Vec<_> = (0..4).filter_map(|_| layout.add_element(64, 64)).collect();
        assert_eq!(placed.len(), 4);
        assert_eq!(layout.add_element(1, 1), None);

        for (x, y) in placed {
            assert!(layout.remove_element(x, y, 64, 64));
        }
        assert!(layout.is_empty());
        assert_eq!(layout.add_element(128, 128), Some((0, 0)));
    }

    #[test]
    fn alignment_rounds_sizes_and_corners() {
        let mut layout = TextureLayout::new(64, 64, 8);
        let (x0, y0) = layout.add_element(5, 5).unwrap();
        let (x1, y1) = layout.add_element(9, 3).unwrap();
        for v in [x0, y0, x1, y1] {
            assert_eq!(v % 8, 0);
        }
        assert_eq!(layout.used_area(), 8 * 8 + 16 * 8);
        assert!(layout.remove_element(x1, y1, 9, 3));
    }

    #[test]
    fn removing_unknown_rect_fails() {
        let mut layout = TextureLayout::new(64, 64, 1);
        layout.add_element(10, 10);
        assert!(!layout.remove_element(0, 0, 11, 10));
        assert!(!layout.remove_element(30, 30, 10, 10));
    }
}

//! Preshadow Cache
//!
//! Preshadows only change when their subject moves far enough, so their
//! depths are kept in a dedicated texture across frames.
//!
//! An entry is keyed by `(primitive, light)` and remembers the expanded
//! bounds and the projection recipe it was rendered with. A later request
//! reuses it when the live subject sphere still fits inside the cached one
//! (with `4%` radius slack) and asks for exactly the same resolution.
//!
//! ```text
//!   setup:  lookup ──hit──► shadow reuses rect + recipe, depths cached
//!             │
//!             └─miss──► new preshadow
//!   update: sweep unreferenced ─► pack new preshadows largest first
//!   render: mark_rendered ─► later lookups hit
//! ```

use rustc_hash::{FxHashMap, FxHashSet};

use super::initializer::ProjectedShadowInitializer;
use super::projected::{AtlasKind, ProjectedShadow, ShadowState, ShadowTarget};
use super::texture_layout::{LayoutRect, TextureLayout};
use crate::errors::Result;
use crate::math::bounds::BoxSphereBounds;
use crate::rhi::{RenderDevice, TextureDesc, TextureHandle};
use crate::scene::{LightId, PrimitiveId};

/// Radius fraction a live subject may stick out of the cached bounds.
pub const CACHE_RADIUS_SLACK: f32 = 0.04;

pub type PreshadowKey = (PrimitiveId, LightId);

/// A preshadow living in the cache texture.
#[derive(Debug, Clone, PartialEq)]
pub struct PreshadowCacheEntry {
    pub primitive: PrimitiveId,
    pub light: LightId,
    /// Expanded subject bounds the depths were rendered for.
    pub bounds: BoxSphereBounds,
    pub resolution_x: u32,
    pub resolution_y: u32,
    /// Allocated rectangle, border included.
    pub rect: LayoutRect,
    pub initializer: ProjectedShadowInitializer,
    /// Depths were written in an earlier frame.
    pub depths_cached: bool,
}

impl PreshadowCacheEntry {
    /// Whether this entry can stand in for a request.
    #[must_use]
    pub fn matches(&self, live_bounds: &BoxSphereBounds, resolution_x: u32, resolution_y: u32) -> bool {
        let cached = self.bounds.sphere();
        self.resolution_x == resolution_x
            && self.resolution_y == resolution_y
            && live_bounds
                .sphere()
                .is_inside(&cached, cached.radius * CACHE_RADIUS_SLACK)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreshadowCacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub insert_failures: usize,
}

/// The persistent preshadow texture and its layout.
#[derive(Debug)]
pub struct PreshadowCache {
    size: u32,
    layout: TextureLayout,
    texture: Option<TextureHandle>,
    entries: FxHashMap<PreshadowKey, PreshadowCacheEntry>,
    stats: PreshadowCacheStats,
}

impl PreshadowCache {
    #[must_use]
    pub fn new(size: u32, alignment: u32) -> Self {
        Self {
            size,
            layout: TextureLayout::new(size, size, alignment),
            texture: None,
            entries: FxHashMap::default(),
            stats: PreshadowCacheStats::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    #[must_use]
    pub fn entry(&self, key: &PreshadowKey) -> Option<&PreshadowCacheEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PreshadowCacheEntry> {
        self.entries.values()
    }

    /// Returns and resets the counters of the current frame.
    pub fn take_stats(&mut self) -> PreshadowCacheStats {
        std::mem::take(&mut self.stats)
    }

    /// Creates the cache texture on first use.
    pub fn ensure_texture(&mut self, device: &mut dyn RenderDevice) -> Result<TextureHandle> {
        if let Some(texture) = self.texture {
            return Ok(texture);
        }
        let texture =
            device.create_texture(&TextureDesc::shadow_depth("Preshadow Cache", self.size, self.size))?;
        self.texture = Some(texture);
        Ok(texture)
    }

    /// Finds a reusable entry for `(primitive, light)`.
    pub fn lookup(
        &mut self,
        primitive: PrimitiveId,
        light: LightId,
        live_bounds: &BoxSphereBounds,
        resolution_x: u32,
        resolution_y: u32,
    ) -> Option<&PreshadowCacheEntry> {
        let hit = self
            .entries
            .get(&(primitive, light))
            .is_some_and(|e| e.depths_cached && e.matches(live_bounds, resolution_x, resolution_y));
        if hit {
            self.stats.hits += 1;
            self.entries.get(&(primitive, light))
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Places a `width` x `height` rectangle (border included).
    pub fn reserve(&mut self, width: u32, height: u32) -> Option<LayoutRect> {
        let (x, y) = self.layout.add_element(width, height)?;
        Some(LayoutRect::new(x, y, width, height))
    }

    /// Frees a rectangle returned by [`reserve`](Self::reserve).
    pub fn release(&mut self, rect: LayoutRect) -> bool {
        self.layout.remove_element(rect.x, rect.y, rect.width, rect.height)
    }

    /// Reserves space for a new entry and records it. Returns the rectangle,
    /// or `None` when the texture is full; the caller then renders the
    /// preshadow into the transient atlas instead.
    pub fn insert(
        &mut self,
        primitive: PrimitiveId,
        light: LightId,
        bounds: BoxSphereBounds,
        resolution: (u32, u32),
        allocation: (u32, u32),
        initializer: ProjectedShadowInitializer,
    ) -> Option<LayoutRect> {
        if let Some(old) = self.entries.remove(&(primitive, light)) {
            self.release(old.rect);
        }
        let Some(rect) = self.reserve(allocation.0, allocation.1) else {
            self.stats.insert_failures += 1;
            return None;
        };
        self.entries.insert(
            (primitive, light),
            PreshadowCacheEntry {
                primitive,
                light,
                bounds,
                resolution_x: resolution.0,
                resolution_y: resolution.1,
                rect,
                initializer,
                depths_cached: false,
            },
        );
        Some(rect)
    }

    /// Records that the entry's depths are now in the texture.
    pub fn mark_rendered(&mut self, key: &PreshadowKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.depths_cached = true;
        }
    }

    /// Drops every entry that was not requested this frame.
    pub fn sweep(&mut self, referenced: &FxHashSet<PreshadowKey>) -> usize {
        let stale: Vec<PreshadowKey> = self
            .entries
            .keys()
            .filter(|key| !referenced.contains(key))
            .copied()
            .collect();
        for key in &stale {
            self.evict(key);
        }
        stale.len()
    }

    /// Drops every entry of a removed primitive.
    pub fn release_primitive(&mut self, primitive: PrimitiveId) {
        let keys: Vec<PreshadowKey> =
            self.entries.keys().filter(|(p, _)| *p == primitive).copied().collect();
        for key in &keys {
            self.evict(key);
        }
    }

    /// Drops every entry cast by a removed light.
    pub fn release_light(&mut self, light: LightId) {
        let keys: Vec<PreshadowKey> =
            self.entries.keys().filter(|(_, l)| *l == light).copied().collect();
        for key in &keys {
            self.evict(key);
        }
    }

    fn evict(&mut self, key: &PreshadowKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.release(entry.rect);
            self.stats.evictions += 1;
            log::debug!("Evicted preshadow {:?} / {:?}", entry.primitive, entry.light);
        }
    }

    /// Drops everything, including the texture.
    pub fn release_all(&mut self, device: &mut dyn RenderDevice) {
        self.entries.clear();
        self.layout.clear();
        if let Some(texture) = self.texture.take() {
            device.destroy_texture(texture);
        }
    }

    /// Texels held by live entries.
    #[must_use]
    pub fn used_area(&self) -> u64 {
        self.layout.used_area()
    }
}

/// Packs this frame's new preshadows into the cache.
///
/// Entries nobody referenced are swept first. Pending preshadows (no target,
/// no cached depths) are inserted largest first; each one that fits gets its
/// cache rectangle as target. Returns how many did not fit; those fall back
/// to the transient atlas.
pub fn update_preshadow_cache(
    cache: &mut PreshadowCache,
    device: &mut dyn RenderDevice,
    shadows: &mut [ProjectedShadow],
    referenced: &FxHashSet<PreshadowKey>,
) -> Result<usize> {
    let evicted = cache.sweep(referenced);
    if evicted > 0 {
        log::debug!("Preshadow cache swept {evicted} stale entries");
    }

    let mut pending: Vec<usize> = shadows
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_preshadow() && s.cache_bounds.is_some() && s.target.is_none() && !s.depths_cached)
        .map(|(i, _)| i)
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }
    let texture = cache.ensure_texture(device)?;
    pending.sort_by_key(|&i| {
        let s = &shadows[i];
        (std::cmp::Reverse(s.area()), s.light_id, s.subject_id())
    });

    let mut failures = 0;
    for i in pending {
        let shadow = &mut shadows[i];
        let (Some(subject), Some(bounds)) = (shadow.subject_id(), shadow.cache_bounds) else {
            continue;
        };
        let inserted = cache.insert(
            subject,
            shadow.light_id,
            bounds,
            (shadow.resolution_x, shadow.resolution_y),
            shadow.allocation_size(),
            shadow.initializer.clone(),
        );
        match inserted {
            Some(rect) => {
                shadow.target = Some(ShadowTarget {
                    atlas: AtlasKind::PreshadowCache,
                    texture,
                    rect,
                    buffer_width: cache.size(),
                    buffer_height: cache.size(),
                });
                shadow.allocated_in_cache = true;
                shadow.state = ShadowState::Allocated;
            }
            None => failures += 1,
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::*;

    fn recipe() -> ProjectedShadowInitializer {
        ProjectedShadowInitializer {
            pre_shadow_translation: Vec3::ZERO,
            pre_subject_matrix: Mat4::IDENTITY,
            subject_matrix: Mat4::IDENTITY,
            post_subject_matrix: Mat4::IDENTITY,
            subject_matrix_fudged: Mat4::IDENTITY,
            max_subject_depth: 1.0,
            max_pre_subject_depth: 1.0,
            min_pre_subject_z: 0.0,
            bounding_radius: 1.0,
            aspect_ratio: 1.0,
            split_index: None,
            directional: false,
            whole_scene: false,
        }
    }

    #[test]
    fn lookup_requires_rendered_depths_and_containment() {
        let mut cache = PreshadowCache::new(256, 1);
        let (p, l) = (PrimitiveId(1), LightId(2));
        let cached = BoxSphereBounds::from_sphere(Vec3::ZERO, 1.15);
        cache.insert(p, l, cached, (32, 32), (42, 42), recipe()).unwrap();

        let live = BoxSphereBounds::from_sphere(Vec3::new(0.1, 0.0, 0.0), 1.0);
        assert!(cache.lookup(p, l, &live, 32, 32).is_none(), "not rendered yet");
        cache.mark_rendered(&(p, l));
        assert!(cache.lookup(p, l, &live, 32, 32).is_some());
        assert!(cache.lookup(p, l, &live, 64, 32).is_none(), "resolution differs");

        let moved = BoxSphereBounds::from_sphere(Vec3::new(0.5, 0.0, 0.0), 1.0);
        assert!(cache.lookup(p, l, &moved, 32, 32).is_none(), "outside slack");
    }

    #[test]
    fn sweep_frees_unreferenced_rects() {
        let mut cache = PreshadowCache::new(64, 1);
        let a = (PrimitiveId(1), LightId(1));
        let b = (PrimitiveId(2), LightId(1));
        let bounds = BoxSphereBounds::from_sphere(Vec3::ZERO, 1.0);
        cache.insert(a.0, a.1, bounds, (22, 22), (32, 32), recipe()).unwrap();
        cache.insert(b.0, b.1, bounds, (22, 22), (32, 32), recipe()).unwrap();

        let referenced: FxHashSet<PreshadowKey> = [a].into_iter().collect();
        assert_eq!(cache.sweep(&referenced), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_area(), 32 * 32);

        cache.release_primitive(a.0);
        assert!(cache.is_empty());
        assert!(cache.reserve(64, 64).is_some(), "layout is whole again");
    }
}

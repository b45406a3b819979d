//! Shadow Atlases
//!
//! | Atlas                | Holds                                  | Lifetime of a rect |
//! |----------------------|----------------------------------------|--------------------|
//! | [`ShadowAtlas`] (transient) | every 2D shadow of the current pass | one pass           |
//! | [`ShadowAtlas`] (dominant)  | split 0 of the primary cascade set  | one pass           |
//! | [`CubeShadowAtlas`]  | point light cube shadows               | one frame          |
//!
//! Rectangles handed out by one atlas never overlap; [`ShadowAtlas::verify`]
//! re-checks that after every pass and reports a violation as a fatal
//! [`ShadowError::AtlasOverlap`].

use rustc_hash::FxHashMap;

use super::projected::{AtlasKind, ProjectedShadow, ShadowTarget};
use super::texture_layout::{LayoutRect, TextureLayout};
use crate::errors::{Result, ShadowError};
use crate::math::transforms::floor_pow2;
use crate::rhi::{RenderDevice, TextureDesc, TextureHandle};
use crate::scene::LightId;

/// A 2D depth texture shared by many shadows.
#[derive(Debug)]
pub struct ShadowAtlas {
    kind: AtlasKind,
    label: &'static str,
    size: u32,
    layout: TextureLayout,
    texture: Option<TextureHandle>,
    /// Shadow id and rectangle of every allocation in the current pass.
    allocations: Vec<(usize, LayoutRect)>,
}

impl ShadowAtlas {
    #[must_use]
    pub fn new(kind: AtlasKind, label: &'static str, size: u32, alignment: u32) -> Self {
        Self {
            kind,
            label,
            size,
            layout: TextureLayout::new(size, size, alignment),
            texture: None,
            allocations: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> AtlasKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    #[must_use]
    pub fn allocations(&self) -> &[(usize, LayoutRect)] {
        &self.allocations
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn ensure_texture(&mut self, device: &mut dyn RenderDevice) -> Result<TextureHandle> {
        if let Some(texture) = self.texture {
            return Ok(texture);
        }
        let texture = device.create_texture(&TextureDesc::shadow_depth(self.label, self.size, self.size))?;
        self.texture = Some(texture);
        Ok(texture)
    }

    /// Starts a new pass with an empty layout.
    pub fn reset(&mut self) {
        self.layout.clear();
        self.allocations.clear();
    }

    /// Places `shadow` and records its target. Returns `false` when the
    /// shadow does not fit in what is left of this pass.
    pub fn allocate(&mut self, device: &mut dyn RenderDevice, shadow: &mut ProjectedShadow) -> Result<bool> {
        let (width, height) = shadow.allocation_size();
        if width > self.size || height > self.size {
            return Ok(false);
        }
        let Some((x, y)) = self.layout.add_element(width, height) else {
            return Ok(false);
        };
        let texture = self.ensure_texture(device)?;
        let rect = LayoutRect::new(x, y, width, height);
        self.allocations.push((shadow.id, rect));
        shadow.target = Some(ShadowTarget {
            atlas: self.kind,
            texture,
            rect,
            buffer_width: self.size,
            buffer_height: self.size,
        });
        Ok(true)
    }

    /// Checks that no two rectangles of the pass overlap or leave the texture.
    pub fn verify(&self) -> Result<()> {
        let bounds = LayoutRect::new(0, 0, self.size, self.size);
        for (i, &(first, a)) in self.allocations.iter().enumerate() {
            if !bounds.contains(&a) {
                return Err(ShadowError::AtlasOverlap {
                    first,
                    second: first,
                });
            }
            if let Some(&(second, _)) = self.allocations[i + 1..].iter().find(|(_, b)| a.overlaps(b)) {
                return Err(ShadowError::AtlasOverlap { first, second });
            }
        }
        Ok(())
    }

    pub fn release(&mut self, device: &mut dyn RenderDevice) {
        self.reset();
        if let Some(texture) = self.texture.take() {
            device.destroy_texture(texture);
        }
    }
}

// ============================================================================
// Cube atlas
// ============================================================================

/// Cube textures of one resolution.
#[derive(Debug)]
struct CubeBucket {
    resolution: u32,
    textures: Vec<TextureHandle>,
    used: usize,
}

/// Cube depth textures grouped into resolution buckets.
///
/// Bucket `i` holds cubes of `max_resolution >> i`. Each point light takes
/// one free cube per frame; every face of that light shares it.
#[derive(Debug)]
pub struct CubeShadowAtlas {
    buckets: Vec<CubeBucket>,
    capacity_per_bucket: usize,
    assigned: FxHashMap<LightId, (TextureHandle, u32)>,
}

impl CubeShadowAtlas {
    pub const BUCKET_COUNT: u32 = 4;
    pub const DEFAULT_CAPACITY: usize = 4;

    #[must_use]
    pub fn new(max_resolution: u32, capacity_per_bucket: usize) -> Self {
        let max_resolution = floor_pow2(max_resolution.max(1));
        let buckets = (0..Self::BUCKET_COUNT)
            .map(|i| CubeBucket {
                resolution: (max_resolution >> i).max(1),
                textures: Vec::new(),
                used: 0,
            })
            .collect();
        Self {
            buckets,
            capacity_per_bucket,
            assigned: FxHashMap::default(),
        }
    }

    /// The bucket resolution used for a request of `resolution` texels.
    #[must_use]
    pub fn bucket_resolution(&self, resolution: u32) -> u32 {
        let rounded = floor_pow2(resolution.max(1));
        self.buckets
            .iter()
            .map(|b| b.resolution)
            .find(|&r| r <= rounded)
            .or_else(|| self.buckets.last().map(|b| b.resolution))
            .unwrap_or(1)
    }

    /// Frees every cube for the next frame; textures are kept.
    pub fn begin_frame(&mut self) {
        for bucket in &mut self.buckets {
            bucket.used = 0;
        }
        self.assigned.clear();
    }

    /// Cube texture of `light` this frame, allocating one on first request.
    pub fn allocate(
        &mut self,
        device: &mut dyn RenderDevice,
        light: LightId,
        resolution: u32,
    ) -> Result<(TextureHandle, u32)> {
        if let Some(&assigned) = self.assigned.get(&light) {
            return Ok(assigned);
        }
        let resolution = self.bucket_resolution(resolution);
        let capacity = self.capacity_per_bucket;
        let Some(bucket) = self.buckets.iter_mut().find(|b| b.resolution == resolution) else {
            return Err(ShadowError::CubeAtlasFull(resolution));
        };
        if bucket.used >= capacity {
            return Err(ShadowError::CubeAtlasFull(resolution));
        }
        if bucket.used == bucket.textures.len() {
            bucket
                .textures
                .push(device.create_texture(&TextureDesc::shadow_cube("Cube Shadow", resolution))?);
        }
        let texture = bucket.textures[bucket.used];
        bucket.used += 1;
        self.assigned.insert(light, (texture, resolution));
        Ok((texture, resolution))
    }

    /// Gives a cube shadow its target.
    pub fn allocate_shadow(&mut self, device: &mut dyn RenderDevice, shadow: &mut ProjectedShadow) -> Result<()> {
        let (texture, resolution) = self.allocate(device, shadow.light_id, shadow.resolution_x)?;
        shadow.resolution_x = resolution;
        shadow.resolution_y = resolution;
        shadow.target = Some(ShadowTarget {
            atlas: AtlasKind::Cube,
            texture,
            rect: LayoutRect::new(0, 0, resolution, resolution),
            buffer_width: resolution,
            buffer_height: resolution,
        });
        Ok(())
    }

    #[must_use]
    pub fn texture_count(&self) -> usize {
        self.buckets.iter().map(|b| b.textures.len()).sum()
    }

    pub fn release(&mut self, device: &mut dyn RenderDevice) {
        for bucket in &mut self.buckets {
            for texture in bucket.textures.drain(..) {
                device.destroy_texture(texture);
            }
            bucket.used = 0;
        }
        self.assigned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::recording::RecordingDevice;

    #[test]
    fn faces_of_one_light_share_a_cube() {
        let mut device = RecordingDevice::default();
        let mut atlas = CubeShadowAtlas::new(512, 2);
        let light = LightId(3);
        let a = atlas.allocate(&mut device, light, 300).unwrap();
        let b = atlas.allocate(&mut device, light, 300).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.1, 256);
        assert_eq!(atlas.texture_count(), 1);
    }

    #[test]
    fn bucket_capacity_is_enforced_per_frame() {
        let mut device = RecordingDevice::default();
        let mut atlas = CubeShadowAtlas::new(512, 1);
        atlas.allocate(&mut device, LightId(1), 512).unwrap();
        assert!(matches!(
            atlas.allocate(&mut device, LightId(2), 512),
            Err(ShadowError::CubeAtlasFull(512))
        ));
        atlas.begin_frame();
        assert!(atlas.allocate(&mut device, LightId(2), 512).is_ok());
        assert_eq!(device.live_texture_count(), 1, "texture reused across frames");
    }
}

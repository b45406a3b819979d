//! Atlas Packing Tests
//!
//! Tests for:
//! - TextureLayout placement never overlapping or leaving the texture
//! - Removal freeing space for reuse
//! - Alignment rounding
//! - Preshadow cache entry matching

use glam::Vec3;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use umbra::math::bounds::BoxSphereBounds;
use umbra::renderer::shadows::preshadow_cache::PreshadowCache;
use umbra::renderer::shadows::{LayoutRect, ProjectedShadowInitializer, TextureLayout};
use umbra::scene::{LightDesc, LightId, LightSceneInfo, PrimitiveId};
use umbra::settings::ShadowSettings;

// ============================================================================
// TextureLayout
// ============================================================================

#[test]
fn random_packing_never_overlaps() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 0..8 {
        let mut layout = TextureLayout::new(512, 512, 1);
        let mut placed: Vec<LayoutRect> = Vec::new();
        for _ in 0..64 {
            let w = rng.random_range(8..=160);
            let h = rng.random_range(8..=160);
            if let Some((x, y)) = layout.add_element(w, h) {
                let rect = LayoutRect::new(x, y, w, h);
                assert!(x + w <= 512 && y + h <= 512, "round {round}: {rect:?} leaves the texture");
                for other in &placed {
                    assert!(!rect.overlaps(other), "round {round}: {rect:?} overlaps {other:?}");
                }
                placed.push(rect);
            }
        }
        assert_eq!(layout.element_count(), placed.len());
        let area: u64 = placed.iter().map(LayoutRect::area).sum();
        assert_eq!(layout.used_area(), area);
    }
}

#[test]
fn full_layout_rejects_then_accepts_after_removal() {
    let mut layout = TextureLayout::new(256, 256, 1);
    let corners: Vec<(u32, u32)> = (0..4).map(|_| layout.add_element(128, 128).unwrap()).collect();
    assert!(layout.add_element(128, 128).is_none(), "layout should be full");

    let (x, y) = corners[2];
    assert!(layout.remove_element(x, y, 128, 128));
    assert_eq!(layout.add_element(128, 128), Some((x, y)));
}

#[test]
fn removing_everything_restores_the_full_surface() {
    let mut layout = TextureLayout::new(256, 256, 1);
    let a = layout.add_element(100, 60).unwrap();
    let b = layout.add_element(40, 150).unwrap();
    assert!(layout.remove_element(a.0, a.1, 100, 60));
    assert!(layout.remove_element(b.0, b.1, 40, 150));
    assert!(layout.is_empty());
    assert_eq!(layout.add_element(256, 256), Some((0, 0)));
}

#[test]
fn unknown_removal_is_refused() {
    let mut layout = TextureLayout::new(128, 128, 1);
    layout.add_element(32, 32).unwrap();
    assert!(!layout.remove_element(64, 64, 32, 32));
    assert_eq!(layout.element_count(), 1);
}

#[test]
fn alignment_rounds_sizes_up() {
    let mut layout = TextureLayout::new(64, 64, 16);
    let (x0, y0) = layout.add_element(10, 10).unwrap();
    let (x1, y1) = layout.add_element(10, 10).unwrap();
    assert_eq!((x0 % 16, y0 % 16, x1 % 16, y1 % 16), (0, 0, 0, 0));
    assert_eq!(layout.used_area(), 2 * 16 * 16);
    assert!(layout.add_element(65, 1).is_none());
}

#[test]
fn zero_sized_elements_are_rejected() {
    let mut layout = TextureLayout::new(64, 64, 1);
    assert!(layout.add_element(0, 8).is_none());
    assert!(layout.is_empty());
}

// ============================================================================
// PreshadowCache
// ============================================================================

fn recipe() -> ProjectedShadowInitializer {
    LightSceneInfo::new(LightDesc::directional(Vec3::NEG_Y))
        .per_object_initializer(&BoxSphereBounds::from_sphere(Vec3::ZERO, 1.0), &ShadowSettings::default())
        .unwrap()
}

fn cached(cache: &mut PreshadowCache, bounds: BoxSphereBounds) -> (PrimitiveId, LightId) {
    let key = (PrimitiveId(11), LightId(3));
    cache
        .insert(key.0, key.1, bounds, (64, 64), (74, 74), recipe())
        .unwrap();
    cache.mark_rendered(&key);
    key
}

#[test]
fn cache_hits_only_inside_expanded_bounds() {
    let mut cache = PreshadowCache::new(1024, 1);
    let expanded = BoxSphereBounds::from_sphere(Vec3::ZERO, 2.3);
    let (p, l) = cached(&mut cache, expanded);

    let still = BoxSphereBounds::from_sphere(Vec3::new(0.2, 0.0, 0.0), 2.0);
    assert!(cache.lookup(p, l, &still, 64, 64).is_some());

    let moved = BoxSphereBounds::from_sphere(Vec3::new(3.0, 0.0, 0.0), 2.0);
    assert!(cache.lookup(p, l, &moved, 64, 64).is_none());

    // Same bounds, different resolution.
    assert!(cache.lookup(p, l, &still, 128, 128).is_none());

    let stats = cache.take_stats();
    assert_eq!((stats.hits, stats.misses), (1, 2));
}

#[test]
fn unrendered_entries_never_hit() {
    let mut cache = PreshadowCache::new(1024, 1);
    let bounds = BoxSphereBounds::from_sphere(Vec3::ZERO, 2.0);
    cache
        .insert(PrimitiveId(1), LightId(1), bounds, (64, 64), (74, 74), recipe())
        .unwrap();
    assert!(cache.lookup(PrimitiveId(1), LightId(1), &bounds, 64, 64).is_none());
}

#[test]
fn sweep_drops_unreferenced_entries() {
    let mut cache = PreshadowCache::new(1024, 1);
    let key = cached(&mut cache, BoxSphereBounds::from_sphere(Vec3::ZERO, 2.0));
    let mut referenced = rustc_hash::FxHashSet::default();
    referenced.insert(key);
    assert_eq!(cache.sweep(&referenced), 0);
    assert_eq!(cache.sweep(&rustc_hash::FxHashSet::default()), 1);
    assert!(cache.is_empty());
}

#[test]
fn full_cache_reports_insert_failure() {
    let mut cache = PreshadowCache::new(128, 1);
    let bounds = BoxSphereBounds::from_sphere(Vec3::ZERO, 1.0);
    let placed = cache.insert(PrimitiveId(1), LightId(1), bounds, (118, 118), (128, 128), recipe());
    assert!(placed.is_some());
    let rejected = cache.insert(PrimitiveId(2), LightId(1), bounds, (54, 54), (64, 64), recipe());
    assert!(rejected.is_none());
    assert_eq!(cache.take_stats().insert_failures, 1);
}

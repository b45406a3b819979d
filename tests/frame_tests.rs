//! Frame Pipeline Tests
//!
//! Tests for:
//! - Directional cascades: split count, view dependence, dominant atlas placement
//! - Per-object shadows and whole-scene coverage
//! - Self-shadow-only receivers and non-modulated self-shadowing passes
//! - Preshadow caching across frames and eviction on removal
//! - Occlusion history hiding primitives after a zero-pixel query
//! - Point light cube shadows with and without geometry amplification
//! - Settings swaps, invalid views and resource release
//! - Deterministic placement and same-frame add/remove

use std::f32::consts::FRAC_PI_3;
use std::sync::Arc;

use glam::{UVec2, Vec3};

use umbra::math::bounds::BoxSphereBounds;
use umbra::renderer::occlusion::OcclusionKey;
use umbra::renderer::shadows::{AtlasKind, LayoutRect};
use umbra::rhi::recording::DeviceCall;
use umbra::rhi::{BlendMode, MeshHandle, VertexShader};
use umbra::scene::{LightFlags, PrimitiveFlags, ShadowProjectionMode};
use umbra::{
    FrameReport, GpuCapabilities, LightDesc, PrimitiveDesc, RecordingDevice, Renderer, Scene,
    ShadowError, ShadowKind, ShadowSettings, ShadowState, ViewDesc, ViewStateId,
};

const EPSILON: f32 = 1e-4;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

fn camera() -> ViewDesc {
    ViewDesc::perspective(
        Vec3::new(0.0, 2.0, 10.0),
        Vec3::NEG_Z,
        FRAC_PI_3,
        UVec2::new(1280, 720),
        0.1,
    )
}

fn sun() -> LightDesc {
    LightDesc::directional(Vec3::new(-0.3, -1.0, -0.2))
}

fn crate_box(mesh: u32) -> PrimitiveDesc {
    PrimitiveDesc::dynamic(BoxSphereBounds::from_sphere(Vec3::ZERO, 1.5), MeshHandle(mesh))
}

fn setup(caps: GpuCapabilities, settings: ShadowSettings) -> (RecordingDevice, Renderer, Scene) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut device = RecordingDevice::new(caps);
    let renderer = Renderer::new(&mut device, Arc::new(settings)).unwrap();
    (device, renderer, Scene::new())
}

fn frame(device: &mut RecordingDevice, renderer: &mut Renderer, scene: &mut Scene, now: f32) -> FrameReport {
    renderer.render_frame(device, scene, &[camera()], now).unwrap()
}

// ============================================================================
// Per-object shadows
// ============================================================================

#[test]
fn dynamic_box_gets_a_projected_per_object_shadow() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene.add_light(sun()).unwrap();
    scene.add_primitive(crate_box(1)).unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);

    assert_eq!(report.stats.per_object, 1, "stats: {:?}", report.stats);
    let shadow = report.shadows_of_kind(ShadowKind::PerObject).next().unwrap();
    assert_eq!(shadow.state, ShadowState::Projected);
    assert!(approx(shadow.fade_alpha(0), 1.0), "fade alpha {}", shadow.fade_alpha(0));
    assert_eq!(shadow.target.map(|t| t.atlas), Some(AtlasKind::Transient));
    assert!(report.stats.depth_draws >= 1);
    assert!(device.projection_draw_count() >= 1);
}

#[test]
fn hidden_primitive_casts_no_shadow() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene.add_light(sun()).unwrap();
    scene
        .add_primitive(crate_box(1).with_flags(PrimitiveFlags::HIDDEN))
        .unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert!(report.shadows.is_empty(), "unexpected shadows: {}", report.shadows.len());
}

#[test]
fn removed_light_stops_casting() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    let light = sun();
    let light_id = light.id;
    scene.add_light(light).unwrap();
    scene.add_primitive(crate_box(1)).unwrap();

    assert_eq!(frame(&mut device, &mut renderer, &mut scene, 0.0).stats.per_object, 1);
    scene.remove_light(light_id).unwrap();
    let report = frame(&mut device, &mut renderer, &mut scene, 0.1);
    assert!(report.shadows.is_empty());
}

// ============================================================================
// Self-shadowing
// ============================================================================

/// `(blend, draw)` for every draw issued while a projection shader is bound.
fn projection_draws(device: &RecordingDevice) -> Vec<(BlendMode, DeviceCall)> {
    let mut blend = BlendMode::Opaque;
    let mut projecting = false;
    let mut draws = Vec::new();
    for call in device.calls() {
        match call {
            DeviceCall::SetBlendMode(mode) => blend = *mode,
            DeviceCall::BindShaders(state) => {
                projecting = matches!(state.vertex, VertexShader::ScreenQuad | VertexShader::ProjectionReceiver);
            }
            DeviceCall::DrawIndexed(..) | DeviceCall::DrawFullscreenQuad if projecting => {
                draws.push((blend, call.clone()));
            }
            _ => {}
        }
    }
    draws
}

fn modulated_sun() -> LightDesc {
    let mut light = sun();
    light.projection_mode = ShadowProjectionMode::Modulate;
    light
}

#[test]
fn ordinary_shadow_covers_the_screen() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene.add_light(sun()).unwrap();
    scene.add_primitive(crate_box(1)).unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);
    let shadow = report.shadows_of_kind(ShadowKind::PerObject).next().unwrap();
    assert!(!shadow.self_shadow_only);
    assert!(shadow.receiver_primitives.is_empty(), "receivers: {:?}", shadow.receiver_primitives);
    assert_eq!(
        projection_draws(&device),
        vec![(BlendMode::MinAttenuation, DeviceCall::DrawFullscreenQuad)]
    );
}

#[test]
fn self_shadow_only_primitive_shadows_itself() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene.add_light(sun()).unwrap();
    let key = scene
        .add_primitive(crate_box(1).with_flags(PrimitiveFlags::SELF_SHADOW_ONLY))
        .unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);
    let shadow = report.shadows_of_kind(ShadowKind::PerObject).next().unwrap();
    assert!(shadow.self_shadow_only);
    assert_eq!(shadow.receiver_primitives, vec![key]);
    assert_eq!(shadow.state, ShadowState::Projected);
    assert_eq!(
        projection_draws(&device),
        vec![(BlendMode::MinAttenuation, DeviceCall::DrawIndexed(MeshHandle(1), 1))]
    );
}

#[test]
fn self_shadow_only_light_restricts_every_subject() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene
        .add_light(
            sun().with_flags(LightFlags::SELF_SHADOW_ONLY | LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS),
        )
        .unwrap();
    let key = scene.add_primitive(crate_box(1)).unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(report.stats.cascades, 0, "self-shadow-only lights fall back to per-object shadows");
    let shadow = report.shadows_of_kind(ShadowKind::PerObject).next().unwrap();
    assert!(shadow.self_shadow_only);
    assert_eq!(shadow.receiver_primitives, vec![key]);
    assert_eq!(
        projection_draws(&device),
        vec![(BlendMode::MinAttenuation, DeviceCall::DrawIndexed(MeshHandle(1), 1))]
    );
}

#[test]
fn modulated_light_multiplies_scene_color() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene.add_light(modulated_sun()).unwrap();
    scene.add_primitive(crate_box(1)).unwrap();

    frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(
        projection_draws(&device),
        vec![(BlendMode::Modulate, DeviceCall::DrawFullscreenQuad)]
    );
}

#[test]
fn non_modulated_self_shadowing_attenuates_the_subject() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene
        .add_light(modulated_sun().with_flags(LightFlags::NON_MODULATED_SELF_SHADOWING))
        .unwrap();
    scene.add_primitive(crate_box(1)).unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);
    let shadow = report.shadows_of_kind(ShadowKind::PerObject).next().unwrap();
    assert!(!shadow.self_shadow_only);
    assert_eq!(
        projection_draws(&device),
        vec![
            (BlendMode::MinAttenuation, DeviceCall::DrawIndexed(MeshHandle(1), 1)),
            (BlendMode::Modulate, DeviceCall::DrawFullscreenQuad),
        ]
    );
}

#[test]
fn non_modulated_self_shadow_only_skips_the_modulated_pass() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene
        .add_light(
            modulated_sun().with_flags(LightFlags::NON_MODULATED_SELF_SHADOWING | LightFlags::SELF_SHADOW_ONLY),
        )
        .unwrap();
    scene.add_primitive(crate_box(1)).unwrap();

    frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(
        projection_draws(&device),
        vec![(BlendMode::MinAttenuation, DeviceCall::DrawIndexed(MeshHandle(1), 1))]
    );
}

// ============================================================================
// Cascades
// ============================================================================

#[test]
fn whole_scene_sun_builds_one_cascade_per_split() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene
        .add_light(sun().with_flags(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS))
        .unwrap();
    scene.add_primitive(crate_box(1)).unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);

    assert_eq!(report.stats.cascades, 3);
    // The box sits well inside the cascade distance.
    assert_eq!(report.stats.per_object, 0);

    for split in 0..3 {
        let cascade = report
            .shadows_of_kind(ShadowKind::WholeSceneCascade { split })
            .next()
            .unwrap_or_else(|| panic!("missing split {split}"));
        assert_eq!(cascade.dependent_view, Some(0));
        assert!(approx(cascade.fade_alpha(0), 1.0));
        assert_eq!(cascade.state, ShadowState::Projected, "split {split}");
    }

    let first = report
        .shadows_of_kind(ShadowKind::WholeSceneCascade { split: 0 })
        .next()
        .unwrap();
    assert_eq!(first.resolution_x, 2038);
    assert_eq!(first.target.map(|t| t.atlas), Some(AtlasKind::Dominant));
    let second = report
        .shadows_of_kind(ShadowKind::WholeSceneCascade { split: 1 })
        .next()
        .unwrap();
    assert_eq!(second.resolution_x, 1024);
    assert_eq!(second.target.map(|t| t.atlas), Some(AtlasKind::Transient));
    assert!(report.stats.depth_draws >= 1);
}

#[test]
fn cascades_follow_the_first_view_only() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene
        .add_light(sun().with_flags(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS))
        .unwrap();

    let second = ViewDesc::perspective(Vec3::new(50.0, 5.0, 0.0), Vec3::NEG_X, FRAC_PI_3, UVec2::new(640, 480), 0.1);
    let report = renderer
        .render_frame(&mut device, &mut scene, &[camera(), second], 0.0)
        .unwrap();

    assert_eq!(report.stats.cascades, 3);
    for cascade in report.shadows.iter().filter(|s| s.is_whole_scene()) {
        assert!(approx(cascade.fade_alpha(1), 0.0), "view 1 alpha {}", cascade.fade_alpha(1));
        assert!(!report.views[1].projected_shadow_visibility[cascade.id]);
    }
}

#[test]
fn small_atlases_cap_cascade_resolution() {
    let settings = ShadowSettings {
        shadow_depth_buffer_size: 64,
        dominant_shadow_buffer_size: 64,
        ..Default::default()
    };
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), settings);
    scene
        .add_light(sun().with_flags(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS))
        .unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(report.stats.cascades, 3);
    for cascade in report.shadows.iter().filter(|s| s.is_whole_scene()) {
        assert!(cascade.resolution_x <= 54, "resolution {}", cascade.resolution_x);
        assert!(cascade.target.is_some(), "{:?} was not placed", cascade.kind);
    }
    assert!(report.stats.atlas_passes >= 2, "passes {}", report.stats.atlas_passes);
    assert_eq!(report.stats.aborted_lights, 0);
}

// ============================================================================
// Preshadow cache
// ============================================================================

fn preshadow_scene(scene: &mut Scene) -> PrimitiveDesc {
    scene
        .add_light(sun().with_flags(LightFlags::STATIC_SHADOWING | LightFlags::ALLOW_PRESHADOW))
        .unwrap();
    let subject = crate_box(1).with_flags(PrimitiveFlags::ALLOW_PRESHADOW);
    scene.add_primitive(subject.clone()).unwrap();
    subject
}

#[test]
fn preshadow_is_cached_and_reused() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    preshadow_scene(&mut scene);

    let first = frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(first.stats.preshadows, 1, "stats: {:?}", first.stats);
    assert_eq!(first.stats.cache_misses, 1);
    assert_eq!(first.cache.misses, 1);
    let pre = first.shadows_of_kind(ShadowKind::PreShadow).next().unwrap();
    assert!(pre.allocated_in_cache);
    assert!(!pre.depths_cached);
    assert_eq!(pre.target.map(|t| t.atlas), Some(AtlasKind::PreshadowCache));
    assert_eq!(renderer.preshadow_cache().len(), 1);
    assert!(renderer.preshadow_cache().entries().all(|e| e.depths_cached));

    let second = frame(&mut device, &mut renderer, &mut scene, 0.1);
    assert_eq!(second.stats.cache_hits, 1, "stats: {:?}", second.stats);
    assert_eq!(second.cache.hits, 1);
    let pre = second.shadows_of_kind(ShadowKind::PreShadow).next().unwrap();
    assert!(pre.depths_cached);
    assert_eq!(pre.target.map(|t| t.rect), first.shadows_of_kind(ShadowKind::PreShadow).next().and_then(|s| s.target.map(|t| t.rect)));
}

#[test]
fn preshadow_survives_hundreds_of_unchanged_frames() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    let subject = preshadow_scene(&mut scene);

    let first = frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(first.stats.cache_misses, 1);
    let rect = first
        .shadows_of_kind(ShadowKind::PreShadow)
        .next()
        .and_then(|s| s.target.map(|t| t.rect));

    for i in 1..300u32 {
        let now = i as f32 / 30.0;
        let report = frame(&mut device, &mut renderer, &mut scene, now);
        assert_eq!(report.stats.cache_hits, 1, "frame {i}: {:?}", report.stats);
        assert_eq!(report.stats.cache_misses, 0, "frame {i}");
        let pre = report.shadows_of_kind(ShadowKind::PreShadow).next().unwrap();
        assert!(pre.depths_cached, "frame {i}");
        assert_eq!(pre.target.map(|t| t.rect), rect, "frame {i}");
        assert_eq!(renderer.preshadow_cache().len(), 1, "frame {i}");
    }

    scene.remove_primitive(subject.id).unwrap();
    frame(&mut device, &mut renderer, &mut scene, 10.0);
    assert!(renderer.preshadow_cache().is_empty());
}

#[test]
fn removing_the_subject_evicts_its_preshadow() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    let subject = preshadow_scene(&mut scene);

    frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(renderer.preshadow_cache().len(), 1);

    scene.remove_primitive(subject.id).unwrap();
    let report = frame(&mut device, &mut renderer, &mut scene, 0.1);
    assert!(renderer.preshadow_cache().is_empty());
    assert_eq!(report.stats.preshadows, 0);
}

#[test]
fn uncached_preshadows_render_every_frame() {
    let settings = ShadowSettings {
        cache_preshadows: false,
        ..Default::default()
    };
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), settings);
    preshadow_scene(&mut scene);

    for now in [0.0, 0.1] {
        let report = frame(&mut device, &mut renderer, &mut scene, now);
        let pre = report.shadows_of_kind(ShadowKind::PreShadow).next().unwrap();
        assert!(!pre.allocated_in_cache);
        assert_eq!(pre.target.map(|t| t.atlas), Some(AtlasKind::Transient));
    }
    assert!(renderer.preshadow_cache().is_empty());
}

// ============================================================================
// Occlusion
// ============================================================================

#[test]
fn zero_pixel_query_hides_the_primitive_next_frame() {
    let mut device = RecordingDevice::default().with_oracle(|_| 0);
    let mut renderer = Renderer::new(&mut device, Arc::new(ShadowSettings::default())).unwrap();
    let mut scene = Scene::new();
    scene.add_light(sun()).unwrap();
    let key = scene.add_primitive(crate_box(1)).unwrap();
    let view = camera().with_state(ViewStateId(7));

    let first = renderer
        .render_frame(&mut device, &mut scene, std::slice::from_ref(&view), 0.0)
        .unwrap();
    assert!(first.views[0].is_visible(key), "first sight must count as visible");
    assert!(first.occlusion[0].individual_queries >= 1);

    let second = renderer
        .render_frame(&mut device, &mut scene, &[view], 0.1)
        .unwrap();
    assert!(!second.views[0].is_visible(key));
    assert_eq!(second.stats.per_object, 0);
    assert!(renderer.occlusion_state(ViewStateId(7)).is_some());
}

#[test]
fn views_without_state_skip_occlusion() {
    let mut device = RecordingDevice::default().with_oracle(|_| 0);
    let mut renderer = Renderer::new(&mut device, Arc::new(ShadowSettings::default())).unwrap();
    let mut scene = Scene::new();
    let key = scene.add_primitive(crate_box(1)).unwrap();

    for now in [0.0, 0.1, 0.2] {
        let report = frame(&mut device, &mut renderer, &mut scene, now);
        assert!(report.views[0].is_visible(key));
        assert!(report.occlusion.is_empty());
    }
    assert_eq!(device.live_query_count(), 0);
}

// ============================================================================
// Point lights
// ============================================================================

fn lamp() -> LightDesc {
    LightDesc::point(Vec3::new(0.0, 4.0, 0.0), 30.0).with_flags(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS)
}

#[test]
fn point_light_renders_one_pass_cube() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    scene
        .add_light(LightDesc::point(Vec3::ZERO, 20.0).with_flags(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS))
        .unwrap();
    for i in 0..8u32 {
        let angle = i as f32 * std::f32::consts::FRAC_PI_4;
        let center = Vec3::new(10.0 * angle.cos(), 0.0, 10.0 * angle.sin());
        scene
            .add_primitive(PrimitiveDesc::dynamic(BoxSphereBounds::from_sphere(center, 1.0), MeshHandle(i + 1)))
            .unwrap();
    }

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(report.shadows.len(), 1, "kinds: {:?}", report.shadows.iter().map(|s| s.kind).collect::<Vec<_>>());
    assert_eq!(report.stats.per_object, 0, "whole-scene point light covers its subjects");
    let cube = report.shadows_of_kind(ShadowKind::OnePassPoint).next().unwrap();
    assert_eq!(cube.target.map(|t| t.atlas), Some(AtlasKind::Cube));
    assert!(cube.one_pass_view_projections.is_some());
    assert_eq!(cube.dynamic_subjects.len(), 8);
    // One amplified draw per subject, not one per face.
    assert_eq!(report.stats.depth_draws, 8);
    assert_eq!(device.depth_draw_count(), 8);
}

#[test]
fn point_light_without_amplification_renders_six_faces() {
    let caps = GpuCapabilities {
        geometry_amplification: false,
        ..Default::default()
    };
    let (mut device, mut renderer, mut scene) = setup(caps, ShadowSettings::default());
    scene.add_light(lamp()).unwrap();
    scene.add_primitive(crate_box(1)).unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(report.stats.cube, 6);
    let mut faces: Vec<u8> = report
        .shadows
        .iter()
        .filter_map(|s| match s.kind {
            ShadowKind::CubeFace { face } => Some(face),
            _ => None,
        })
        .collect();
    faces.sort_unstable();
    assert_eq!(faces, vec![0, 1, 2, 3, 4, 5]);
    assert!(report.shadows.iter().all(|s| s.target.is_some()));
}

// ============================================================================
// Renderer lifecycle
// ============================================================================

#[test]
fn zero_sized_view_is_rejected() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    let mut view = camera();
    view.size = UVec2::ZERO;
    let result = renderer.render_frame(&mut device, &mut scene, &[view], 0.0);
    assert!(matches!(result, Err(ShadowError::InvalidView(_))), "got {result:?}");
}

#[test]
fn invalid_settings_are_refused() {
    let (_device, mut renderer, _scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    let bad = ShadowSettings {
        min_shadow_resolution: 1024,
        max_shadow_resolution: 256,
        ..Default::default()
    };
    assert!(matches!(
        renderer.set_settings(Arc::new(bad)),
        Err(ShadowError::InvalidSettings(_))
    ));
    assert_eq!(renderer.settings().max_shadow_resolution, 512);
}

#[test]
fn atlases_respect_the_device_texture_limit() {
    let caps = GpuCapabilities {
        max_texture_size: 1024,
        ..Default::default()
    };
    let (mut device, mut renderer, mut scene) = setup(caps, ShadowSettings::default());
    assert_eq!(renderer.settings().shadow_depth_buffer_size, 1024);
    assert_eq!(renderer.settings().dominant_shadow_buffer_size, 1024);
    scene
        .add_light(sun().with_flags(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS))
        .unwrap();
    scene.add_primitive(crate_box(1)).unwrap();

    let report = frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert_eq!(report.stats.cascades, 3);
    for call in device.calls() {
        if let DeviceCall::CreateTexture(_, desc) = call {
            assert!(desc.width <= 1024 && desc.height <= 1024, "{} is {}x{}", desc.label, desc.width, desc.height);
        }
    }

    renderer.set_settings(Arc::new(ShadowSettings::default())).unwrap();
    assert_eq!(renderer.settings().shadow_depth_buffer_size, 1024);
}

#[test]
fn frame_counter_advances() -> anyhow::Result<()> {
    let mut device = RecordingDevice::default();
    let mut renderer = Renderer::new(&mut device, Arc::new(ShadowSettings::default()))?;
    let mut scene = Scene::new();
    assert_eq!(renderer.render_frame(&mut device, &mut scene, &[camera()], 0.0)?.frame, 1);
    assert_eq!(renderer.render_frame(&mut device, &mut scene, &[camera()], 0.1)?.frame, 2);
    assert_eq!(renderer.frame(), 2);
    Ok(())
}

#[test]
fn release_destroys_every_texture() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    preshadow_scene(&mut scene);
    scene
        .add_light(sun().with_flags(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS))
        .unwrap();
    frame(&mut device, &mut renderer, &mut scene, 0.0);
    assert!(device.live_texture_count() > 0);

    renderer.release(&mut device);
    assert_eq!(device.live_texture_count(), 0, "leaked textures");
}

// ============================================================================
// Determinism and scene edits
// ============================================================================

fn busy_scene(scene: &mut Scene) {
    scene
        .add_light(sun().with_flags(LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS))
        .unwrap();
    scene.add_light(LightDesc::point(Vec3::new(0.0, 6.0, -20.0), 25.0)).unwrap();
    for i in 0..6u32 {
        let center = Vec3::new(i as f32 * 3.0 - 7.5, 0.0, -10.0 - i as f32 * 4.0);
        let radius = 0.5 + i as f32 * 0.4;
        scene
            .add_primitive(PrimitiveDesc::dynamic(BoxSphereBounds::from_sphere(center, radius), MeshHandle(i + 1)))
            .unwrap();
    }
}

type Placement = (ShadowKind, u32, u32, Option<(AtlasKind, LayoutRect)>);

fn placements(report: &FrameReport) -> Vec<Placement> {
    report
        .shadows
        .iter()
        .map(|s| (s.kind, s.resolution_x, s.resolution_y, s.target.map(|t| (t.atlas, t.rect))))
        .collect()
}

#[test]
fn unchanged_inputs_give_identical_placements() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
        busy_scene(&mut scene);
        let first = placements(&frame(&mut device, &mut renderer, &mut scene, 0.0));
        let again = placements(&frame(&mut device, &mut renderer, &mut scene, 0.0));
        assert_eq!(first, again, "same renderer, same inputs");
        runs.push(first);
    }
    assert!(!runs[0].is_empty());
    assert!(runs[0].iter().all(|(_, _, _, target)| target.is_some()), "unplaced: {:?}", runs[0]);
    assert_eq!(runs[0], runs[1], "fresh renderers disagree");
}

#[test]
fn add_and_remove_in_one_frame_leaves_nothing_behind() {
    let (mut device, mut renderer, mut scene) = setup(GpuCapabilities::default(), ShadowSettings::default());
    let view = camera().with_state(ViewStateId(3));
    scene
        .add_light(sun().with_flags(LightFlags::STATIC_SHADOWING | LightFlags::ALLOW_PRESHADOW))
        .unwrap();
    let kept_desc = PrimitiveDesc::dynamic(BoxSphereBounds::from_sphere(Vec3::new(-3.0, 0.0, 0.0), 1.0), MeshHandle(1));
    let kept = scene.add_primitive(kept_desc).unwrap();
    renderer
        .render_frame(&mut device, &mut scene, std::slice::from_ref(&view), 0.0)
        .unwrap();
    let histories = renderer.occlusion_state(ViewStateId(3)).unwrap().history_count();

    let transient = crate_box(2).with_flags(PrimitiveFlags::ALLOW_PRESHADOW);
    let transient_id = transient.id;
    scene.add_primitive(transient).unwrap();
    scene.remove_primitive(transient_id).unwrap();

    let report = renderer
        .render_frame(&mut device, &mut scene, std::slice::from_ref(&view), 0.1)
        .unwrap();
    assert_eq!(scene.primitive_count(), 1);
    assert!(report.views[0].is_visible(kept));
    assert!(
        report.shadows.iter().all(|s| s.subject_id() != Some(transient_id)),
        "a shadow still references the removed primitive"
    );
    assert!(renderer.preshadow_cache().is_empty(), "cache: {}", renderer.preshadow_cache().len());

    let state = renderer.occlusion_state(ViewStateId(3)).unwrap();
    assert!(!state.has_history(&OcclusionKey::Primitive(transient_id)));
    assert_eq!(state.history_count(), histories);
}

//! Shadow Setup Benchmarks
//!
//! Measures the CPU side of a shadow frame against the recording device:
//! - Per-object shadows for a grid of dynamic boxes under a sun
//! - Whole-scene cascades over the same grid
//! - Atlas packing with [`TextureLayout`]

use std::f32::consts::FRAC_PI_3;
use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use glam::{UVec2, Vec3};

use umbra::math::bounds::BoxSphereBounds;
use umbra::renderer::shadows::TextureLayout;
use umbra::rhi::MeshHandle;
use umbra::scene::LightFlags;
use umbra::{LightDesc, PrimitiveDesc, RecordingDevice, Renderer, Scene, ShadowSettings, ViewDesc};

fn camera() -> ViewDesc {
    ViewDesc::perspective(
        Vec3::new(0.0, 8.0, 40.0),
        Vec3::new(0.0, -0.2, -1.0).normalize(),
        FRAC_PI_3,
        UVec2::new(1920, 1080),
        0.1,
    )
}

fn box_grid(scene: &mut Scene, side: u32) {
    let half = side as f32 * 2.0;
    for i in 0..side * side {
        let center = Vec3::new((i % side) as f32 * 4.0 - half, 1.0, (i / side) as f32 * -4.0);
        let bounds = BoxSphereBounds::from_sphere(center, 1.2);
        if let Err(err) = scene.add_primitive(PrimitiveDesc::dynamic(bounds, MeshHandle(i))) {
            log::warn!("skipping box {i}: {err}");
        }
    }
}

fn build(light_flags: LightFlags, side: u32) -> (RecordingDevice, Renderer, Scene) {
    let mut device = RecordingDevice::default();
    let renderer = Renderer::new(&mut device, Arc::new(ShadowSettings::default()))
        .expect("default settings are valid");
    let mut scene = Scene::new();
    scene
        .add_light(LightDesc::directional(Vec3::new(-0.3, -1.0, -0.2)).with_flags(light_flags))
        .expect("light");
    box_grid(&mut scene, side);
    (device, renderer, scene)
}

fn bench_frames(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut group = c.benchmark_group("render_frame");
    for side in [4u32, 8, 16] {
        let cases = [
            ("per_object", LightFlags::empty()),
            ("cascades", LightFlags::WHOLE_SCENE_DYNAMIC_SHADOWS),
        ];
        for (name, flags) in cases {
            let (mut device, mut renderer, mut scene) = build(flags, side);
            let views = [camera()];
            let mut now = 0.0;
            group.bench_with_input(BenchmarkId::new(name, side * side), &side, |b, _| {
                b.iter(|| {
                    now += 1.0 / 60.0;
                    let report = renderer
                        .render_frame(&mut device, &mut scene, &views, now)
                        .expect("frame");
                    device.reset_log();
                    black_box(report.stats)
                });
            });
        }
    }
    group.finish();
}

fn bench_packing(c: &mut Criterion) {
    c.bench_function("texture_layout_pack_256", |b| {
        b.iter(|| {
            let mut layout = TextureLayout::new(2048, 2048, 1);
            let mut placed = 0u32;
            for i in 0..256u32 {
                let size = 32 + (i * 37) % 224;
                if layout.add_element(size, size).is_some() {
                    placed += 1;
                }
            }
            black_box(placed)
        });
    });
}

criterion_group!(benches, bench_frames, bench_packing);
criterion_main!(benches);

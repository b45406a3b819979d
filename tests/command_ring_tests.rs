//! Render Command Ring Tests
//!
//! Tests for:
//! - Commands executing in order on the render thread
//! - Fences completing once earlier commands have run
//! - Flush releasing deferred cleanup objects
//! - Panics inside commands marking the thread unhealthy
//! - Suspension, tickables and oversized commands

use std::f32::consts::FRAC_PI_3;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use glam::{UVec2, Vec3};

use umbra::math::bounds::BoxSphereBounds;
use umbra::renderer::command::{RenderFence, Tickable, command_ring};
use umbra::rhi::MeshHandle;
use umbra::{
    LightDesc, PrimitiveDesc, RecordingDevice, RenderCommand, RenderContext, Renderer,
    RenderingThread, Scene, ShadowError, ShadowKind, ShadowSettings, ViewDesc,
};

fn context() -> RenderContext {
    let mut device = RecordingDevice::default();
    let renderer = Renderer::new(&mut device, Arc::new(ShadowSettings::default())).unwrap();
    RenderContext::new(Scene::new(), renderer, Box::new(device))
}

fn spawn() -> RenderingThread {
    RenderingThread::spawn(context()).unwrap()
}

fn crate_box() -> PrimitiveDesc {
    PrimitiveDesc::dynamic(BoxSphereBounds::from_sphere(Vec3::ZERO, 1.5), MeshHandle(1))
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

// ============================================================================
// Ordering & fences
// ============================================================================

#[test]
fn commands_reach_the_render_scene() -> anyhow::Result<()> {
    let thread = spawn();
    thread.enqueue(RenderCommand::AddPrimitive(crate_box()))?;
    thread.enqueue(RenderCommand::AddLight(LightDesc::directional(Vec3::NEG_Y)))?;
    thread.fence()?.wait(thread.health())?;

    let context = thread.stop()?;
    assert_eq!(context.scene.primitive_count(), 1);
    assert_eq!(context.scene.light_count(), 1);
    Ok(())
}

#[test]
fn execute_sees_every_earlier_command() {
    let thread = spawn();
    let (tx, rx) = flume::unbounded();
    for _ in 0..3 {
        thread.enqueue(RenderCommand::AddPrimitive(crate_box())).unwrap();
    }
    thread
        .enqueue(RenderCommand::Execute(Box::new(move |ctx| {
            tx.send(ctx.scene.primitive_count()).unwrap();
        })))
        .unwrap();

    let count = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(count, 3);
}

#[test]
fn fence_counts_outstanding_signals() {
    let fence = RenderFence::new();
    let a = fence.signal();
    let b = fence.signal();
    assert_eq!(fence.pending(), 2);
    a.fire();
    assert!(!fence.is_complete());
    b.fire();
    assert!(fence.is_complete());
}

#[test]
fn render_frame_command_stores_the_report() {
    let thread = spawn();
    thread
        .enqueue(RenderCommand::AddLight(LightDesc::directional(Vec3::new(-0.3, -1.0, -0.2))))
        .unwrap();
    thread.enqueue(RenderCommand::AddPrimitive(crate_box())).unwrap();
    thread
        .enqueue(RenderCommand::RenderFrame {
            views: vec![camera()],
            now: 0.0,
        })
        .unwrap();

    let context = thread.stop().unwrap();
    let report = context.last_report.expect("frame was rendered");
    assert_eq!(report.frame, 1);
    assert_eq!(report.shadows_of_kind(ShadowKind::PerObject).count(), 1);
}

#[test]
fn removing_an_unknown_primitive_is_not_fatal() {
    let thread = spawn();
    thread
        .enqueue(RenderCommand::RemovePrimitive(crate_box().id))
        .unwrap();
    thread.fence().unwrap().wait(thread.health()).unwrap();
    assert!(thread.health().is_healthy());
}

// ============================================================================
// Cleanup & failure
// ============================================================================

#[test]
fn flush_releases_deferred_cleanup() {
    let thread = spawn();
    let marker = Arc::new(());
    thread.defer_cleanup(Box::new(Arc::clone(&marker)));
    thread.defer_cleanup(Box::new(vec![0u8; 64]));
    assert_eq!(thread.pending_cleanup(), 2);

    thread.flush().unwrap();
    assert_eq!(thread.pending_cleanup(), 0);
    assert_eq!(Arc::strong_count(&marker), 1, "deferred object still alive");
}

#[test]
fn panic_in_command_marks_thread_unhealthy() {
    let thread = spawn();
    thread
        .enqueue(RenderCommand::Execute(Box::new(|_| panic!("device lost"))))
        .unwrap();

    // The fence signal queued after the panic never fires.
    let fence = RenderFence::new();
    let _ = thread.enqueue(RenderCommand::Fence(fence.signal()));
    match fence.wait(thread.health()) {
        Err(ShadowError::RenderThreadUnhealthy(msg)) => {
            assert!(msg.contains("device lost"), "message: {msg}");
        }
        other => panic!("expected unhealthy thread, got {other:?}"),
    }

    assert!(matches!(
        thread.enqueue(RenderCommand::Stop),
        Err(ShadowError::RenderThreadUnhealthy(_))
    ));
    assert!(thread.stop().is_err());
}

#[test]
fn oversized_commands_are_rejected() {
    let thread = RenderingThread::spawn_with_capacity(context(), 8).unwrap();
    assert!(matches!(
        thread.enqueue(RenderCommand::AddPrimitive(crate_box())),
        Err(ShadowError::CommandTooLarge { capacity: 8, .. })
    ));
    // Dropping the handle must still end the thread.
    drop(thread);
}

#[test]
fn ring_tracks_reserved_bytes() {
    let (producer, consumer) = command_ring(1 << 16);
    producer.enqueue(RenderCommand::AddPrimitive(crate_box())).unwrap();
    producer.enqueue(RenderCommand::Stop).unwrap();
    let used = producer.used();
    assert!(used > 0);

    let read = consumer
        .wait_for_read(Duration::from_millis(10))
        .unwrap()
        .unwrap();
    assert_eq!(read.command.name(), "AddPrimitive");
    consumer.finish_read(read.size);
    assert_eq!(producer.used(), used - read.size);
}

// ============================================================================
// Suspension & ticking
// ============================================================================

#[test]
fn suspended_thread_holds_commands_back() {
    let thread = spawn();
    let ran = Arc::new(AtomicBool::new(false));
    let guard = thread.suspend();
    // Let an idle wait already in progress run out.
    std::thread::sleep(Duration::from_millis(50));

    let flag = Arc::clone(&ran);
    thread
        .enqueue(RenderCommand::Execute(Box::new(move |_| {
            flag.store(true, Ordering::SeqCst);
        })))
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst), "command ran while suspended");

    drop(guard);
    thread.fence().unwrap().wait(thread.health()).unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

struct Counter(Arc<AtomicU32>);

impl Tickable for Counter {
    fn tick(&mut self, delta_seconds: f32) {
        assert!(delta_seconds > 0.0);
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn idle_thread_ticks_tickables() {
    let thread = spawn();
    let ticks = Arc::new(AtomicU32::new(0));
    thread
        .enqueue(RenderCommand::AddTickable(Box::new(Counter(Arc::clone(&ticks)))))
        .unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(ticks.load(Ordering::SeqCst) > 0, "no tick while idle");
}

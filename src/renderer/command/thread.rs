//! Render Thread
//!
//! Owns the render-side [`Scene`], the [`Renderer`] and the device, and
//! executes [`RenderCommand`]s in the order the scene thread issued them.
//!
//! # Suspension points
//!
//! - Idle: the ring is polled with a 16 ms timeout; tickables run at up to
//!   40 Hz while nothing arrives.
//! - Flush: [`RenderCommand::Flush`] blocks until the GPU is idle before
//!   freeing deferred cleanup objects.
//! - Suspend: while the [`RenderingThread::suspend`] refcount is non-zero the
//!   loop sleeps in 1 ms steps between commands.
//!
//! # Failure
//!
//! A panic or fatal error inside a command marks [`RenderThreadHealth`]
//! unhealthy with its message and ends the loop. The scene thread sees it on
//! its next [`RenderThreadHealth::check`].

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::commands::RenderCommand;
use super::fence::RenderFence;
use super::ring::{CommandConsumer, CommandProducer, RENDERING_COMMAND_BUFFER_SIZE, command_ring};
use crate::errors::{Result, ShadowError};
use crate::renderer::{FrameReport, Renderer};
use crate::rhi::RenderDevice;
use crate::scene::Scene;

const IDLE_WAIT: Duration = Duration::from_millis(16);
const SUSPEND_SLEEP: Duration = Duration::from_millis(1);
/// 40 Hz.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(25);

// ============================================================================
// Health
// ============================================================================

#[derive(Debug)]
pub struct RenderThreadHealth {
    healthy: AtomicBool,
    message: Mutex<Option<String>>,
}

impl Default for RenderThreadHealth {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            message: Mutex::new(None),
        }
    }
}

impl RenderThreadHealth {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Re-raises a render-thread failure on the calling thread.
    pub fn check(&self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        let message = self.message.lock().clone().unwrap_or_default();
        Err(ShadowError::RenderThreadUnhealthy(message))
    }

    pub(crate) fn fail(&self, message: String) {
        log::error!("Render thread failed: {message}");
        *self.message.lock() = Some(message);
        self.healthy.store(false, Ordering::Release);
    }
}

// ============================================================================
// Tickables and deferred cleanup
// ============================================================================

/// Work ticked on the render thread while it waits for commands.
pub trait Tickable: Send {
    fn tick(&mut self, delta_seconds: f32);

    fn is_tickable(&self) -> bool {
        true
    }
}

/// Objects released by the scene thread that the GPU may still reference.
///
/// They pile up here and are dropped by the render thread at the next flush,
/// after the GPU has gone idle.
#[derive(Default)]
pub struct DeferredCleanup {
    pending: Mutex<Vec<Box<dyn Any + Send>>>,
}

impl std::fmt::Debug for DeferredCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredCleanup")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl DeferredCleanup {
    pub fn push(&self, object: Box<dyn Any + Send>) {
        self.pending.lock().push(object);
    }

    /// Hands the whole list over and leaves an empty one behind.
    #[must_use]
    pub fn take_pending(&self) -> Vec<Box<dyn Any + Send>> {
        std::mem::take(&mut *self.pending.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Render context
// ============================================================================

/// Everything the render thread owns.
pub struct RenderContext {
    pub scene: Scene,
    pub renderer: Renderer,
    pub device: Box<dyn RenderDevice>,
    pub last_report: Option<FrameReport>,
    tickables: Vec<Box<dyn Tickable>>,
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("lights", &self.scene.light_count())
            .field("primitives", &self.scene.primitive_count())
            .field("tickables", &self.tickables.len())
            .finish_non_exhaustive()
    }
}

impl RenderContext {
    #[must_use]
    pub fn new(scene: Scene, renderer: Renderer, device: Box<dyn RenderDevice>) -> Self {
        Self {
            scene,
            renderer,
            device,
            last_report: None,
            tickables: Vec::new(),
        }
    }

    fn execute(&mut self, command: RenderCommand, cleanup: &DeferredCleanup) -> Result<bool> {
        match command {
            RenderCommand::AddPrimitive(desc) => {
                self.scene.add_primitive(desc)?;
            }
            RenderCommand::RemovePrimitive(id) => self.scene.remove_primitive(id)?,
            RenderCommand::UpdatePrimitiveTransform { id, bounds } => {
                self.scene.update_primitive_transform(id, bounds)?;
            }
            RenderCommand::AddLight(desc) => {
                self.scene.add_light(desc)?;
            }
            RenderCommand::RemoveLight(id) => self.scene.remove_light(id)?,
            RenderCommand::UpdateLightTransform {
                id,
                position,
                direction,
            } => self.scene.update_light_transform(id, position, direction)?,
            RenderCommand::UpdateLightColorAndBrightness {
                id,
                color,
                brightness,
            } => self
                .scene
                .update_light_color_and_brightness(id, color, brightness)?,
            RenderCommand::UpdateModShadowColor { id, color } => {
                self.scene.update_mod_shadow_color(id, color)?;
            }
            RenderCommand::AttachLightEnvironment { primitive, lights } => {
                self.scene.attach_light_environment(primitive, lights)?;
            }
            RenderCommand::SetSettings(settings) => self.renderer.set_settings(settings)?,
            RenderCommand::RenderFrame { views, now } => {
                let report =
                    self.renderer
                        .render_frame(self.device.as_mut(), &mut self.scene, &views, now)?;
                self.last_report = Some(report);
            }
            RenderCommand::AddTickable(tickable) => self.tickables.push(tickable),
            RenderCommand::Execute(task) => task(self),
            RenderCommand::Fence(signal) => signal.fire(),
            RenderCommand::Flush(signal) => {
                self.device.wait_for_idle();
                let released = cleanup.take_pending();
                if !released.is_empty() {
                    log::debug!("Released {} deferred cleanup objects", released.len());
                }
                drop(released);
                signal.fire();
            }
            RenderCommand::Stop => return Ok(false),
        }
        Ok(true)
    }

    fn tick(&mut self, delta_seconds: f32) {
        for tickable in &mut self.tickables {
            if tickable.is_tickable() {
                tickable.tick(delta_seconds);
            }
        }
    }
}

// ============================================================================
// RenderingThread
// ============================================================================

#[derive(Debug, Default)]
struct Shared {
    health: RenderThreadHealth,
    suspend_count: AtomicU32,
    cleanup: DeferredCleanup,
}

/// Scene-thread handle to the running render thread.
#[derive(Debug)]
pub struct RenderingThread {
    producer: Option<CommandProducer>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<RenderContext>>,
}

impl RenderingThread {
    pub fn spawn(context: RenderContext) -> Result<Self> {
        Self::spawn_with_capacity(context, RENDERING_COMMAND_BUFFER_SIZE)
    }

    pub fn spawn_with_capacity(context: RenderContext, ring_capacity: usize) -> Result<Self> {
        let (producer, consumer) = command_ring(ring_capacity);
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("RenderThread".into())
            .spawn(move || render_loop(context, &consumer, &thread_shared))
            .map_err(ShadowError::ThreadError)?;
        log::info!("Render thread started, ring capacity {ring_capacity} bytes");
        Ok(Self {
            producer: Some(producer),
            shared,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn health(&self) -> &RenderThreadHealth {
        &self.shared.health
    }

    /// Queues a command. Fails if the render thread has died.
    pub fn enqueue(&self, command: RenderCommand) -> Result<()> {
        self.shared.health.check()?;
        self.producer
            .as_ref()
            .ok_or(ShadowError::RingDisconnected)?
            .enqueue(command)
    }

    /// Queues a fence signal and returns the fence to wait on.
    pub fn fence(&self) -> Result<RenderFence> {
        let fence = RenderFence::new();
        self.enqueue(RenderCommand::Fence(fence.signal()))?;
        Ok(fence)
    }

    /// Waits until every queued command has run, the GPU is idle and
    /// deferred cleanup objects are released.
    pub fn flush(&self) -> Result<()> {
        let fence = RenderFence::new();
        self.enqueue(RenderCommand::Flush(fence.signal()))?;
        fence.wait(&self.shared.health)
    }

    /// Hands an object to the render thread for release at the next flush.
    pub fn defer_cleanup(&self, object: Box<dyn Any + Send>) {
        self.shared.cleanup.push(object);
    }

    #[must_use]
    pub fn pending_cleanup(&self) -> usize {
        self.shared.cleanup.len()
    }

    /// Pauses command processing until the guard is dropped. Nests.
    #[must_use]
    pub fn suspend(&self) -> SuspendGuard {
        self.shared.suspend_count.fetch_add(1, Ordering::AcqRel);
        SuspendGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Sends `Stop` and closes the ring. The render thread ends after
    /// whichever comes first.
    fn close(&mut self) {
        if let Some(producer) = self.producer.take() {
            if self.shared.health.is_healthy() {
                if let Err(err) = producer.enqueue(RenderCommand::Stop) {
                    log::debug!("Stop not queued ({err}), closing the ring instead");
                }
            }
        }
    }

    /// Drains the ring, ends the thread and returns its state.
    pub fn stop(mut self) -> Result<RenderContext> {
        let handle = self.handle.take().ok_or(ShadowError::RingDisconnected)?;
        self.close();
        let context = handle.join().map_err(|payload| {
            ShadowError::RenderThreadPanicked(panic_message(payload.as_ref()))
        })?;
        self.shared.health.check()?;
        log::info!("Render thread stopped");
        Ok(context)
    }
}

impl Drop for RenderingThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.close();
            let _ = handle.join();
        }
    }
}

/// Keeps the render thread suspended while alive.
#[derive(Debug)]
pub struct SuspendGuard {
    shared: Arc<Shared>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.shared.suspend_count.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn render_loop(
    mut context: RenderContext,
    consumer: &CommandConsumer,
    shared: &Shared,
) -> RenderContext {
    let mut last_tick = Instant::now();
    loop {
        while shared.suspend_count.load(Ordering::Acquire) > 0 {
            std::thread::sleep(SUSPEND_SLEEP);
        }

        let read = match consumer.wait_for_read(IDLE_WAIT) {
            Ok(Some(read)) => read,
            Ok(None) => {
                let elapsed = last_tick.elapsed();
                if elapsed >= MIN_TICK_INTERVAL {
                    context.tick(elapsed.as_secs_f32());
                    last_tick = Instant::now();
                }
                continue;
            }
            Err(_) => {
                log::info!("Command ring closed, render thread exiting");
                break;
            }
        };

        let name = read.command.name();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            context.execute(read.command, &shared.cleanup)
        }));
        consumer.finish_read(read.size);

        match outcome {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => break,
            Ok(Err(err)) if err.is_fatal() => {
                shared.health.fail(format!("{name}: {err}"));
                break;
            }
            Ok(Err(err)) => log::warn!("{name} failed: {err}"),
            Err(payload) => {
                shared
                    .health
                    .fail(format!("{name} panicked: {}", panic_message(payload.as_ref())));
                break;
            }
        }
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_hand_off_swaps_the_list() {
        let cleanup = DeferredCleanup::default();
        cleanup.push(Box::new(1_u32));
        cleanup.push(Box::new("two"));
        let taken = cleanup.take_pending();
        assert_eq!(taken.len(), 2);
        assert!(cleanup.is_empty());
    }

    #[test]
    fn health_reports_the_failure_message() {
        let health = RenderThreadHealth::default();
        assert!(health.check().is_ok());
        health.fail("boom".into());
        match health.check() {
            Err(ShadowError::RenderThreadUnhealthy(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected unhealthy, got {other:?}"),
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::thread::RenderThreadHealth;
use crate::errors::Result;

/// Completion counter shared between a fence and its queued signals.
///
/// The render thread decrements with `Release` after the commands before
/// the signal have executed; the waiter reads with `Acquire`, so everything
/// those commands wrote is visible once the count reaches zero.
#[derive(Debug, Default, Clone)]
pub struct RenderFence {
    pending: Arc<AtomicU32>,
}

impl RenderFence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one more outstanding signal.
    #[must_use]
    pub fn signal(&self) -> FenceSignal {
        self.pending.fetch_add(1, Ordering::AcqRel);
        FenceSignal {
            pending: Arc::clone(&self.pending),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    /// Outstanding signals.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Spins until every signal has fired, yielding between polls.
    ///
    /// Fails as soon as the render thread is reported unhealthy, since its
    /// signals will never arrive.
    pub fn wait(&self, health: &RenderThreadHealth) -> Result<()> {
        while !self.is_complete() {
            health.check()?;
            std::thread::yield_now();
        }
        Ok(())
    }
}

/// The render-thread half of a [`RenderFence`].
#[derive(Debug)]
pub struct FenceSignal {
    pending: Arc<AtomicU32>,
}

impl FenceSignal {
    pub fn fire(self) {
        self.pending.fetch_sub(1, Ordering::Release);
    }
}

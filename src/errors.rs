//! Error Types
//!
//! This module defines the error types used throughout the shadow subsystem.
//!
//! # Overview
//!
//! The main error type [`ShadowError`] covers three classes of failure:
//! - **Recoverable, per-shadow**: atlas packing failures, occlusion query
//!   pool exhaustion, preshadow cache reservation failures. Callers downgrade
//!   locally (skip caching, treat as visible) and log once.
//! - **Configuration**: invalid settings snapshots, malformed JSON overrides.
//! - **Fatal**: render-thread panics, command ring overflow, atlas layout
//!   corruption. These surface through the render thread health flag.
//!
//! # Usage
//!
//! All public APIs return [`Result<T>`] which is an alias for `std::result::Result<T, ShadowError>`.
//!
//! ```rust,ignore
//! use umbra::errors::{ShadowError, Result};
//!
//! fn pack() -> Result<()> {
//!     // Operations that may fail return Result
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::scene::{LightId, PrimitiveId};

/// The main error type for the shadow subsystem.
#[derive(Error, Debug)]
pub enum ShadowError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// A settings snapshot failed validation.
    #[error("Invalid shadow settings: {0}")]
    InvalidSettings(String),

    /// JSON settings override could not be parsed.
    #[error("Settings parse error: {0}")]
    SettingsParse(#[from] serde_json::Error),

    // ========================================================================
    // Scene Errors
    // ========================================================================
    /// The referenced primitive is not attached to the scene.
    #[error("Unknown primitive: {0:?}")]
    UnknownPrimitive(PrimitiveId),

    /// The referenced light is not attached to the scene.
    #[error("Unknown light: {0:?}")]
    UnknownLight(LightId),

    /// A primitive or light was attached twice under the same id.
    #[error("Duplicate scene id: {0}")]
    DuplicateId(u32),

    /// A view descriptor is unusable (zero size, singular projection...).
    #[error("Invalid view: {0}")]
    InvalidView(String),

    // ========================================================================
    // Atlas & Resource Errors
    // ========================================================================
    /// A shadow rectangle did not fit in the atlas.
    #[error("Shadow atlas full: cannot place {width}x{height}")]
    AtlasFull {
        /// Requested width including border
        width: u32,
        /// Requested height including border
        height: u32,
    },

    /// Two allocated shadows would overlap inside the same atlas.
    #[error("Shadow atlas overlap between shadow {first} and shadow {second}")]
    AtlasOverlap {
        /// Index of the first shadow
        first: usize,
        /// Index of the second shadow
        second: usize,
    },

    /// No cube map of the requested resolution is free.
    #[error("No free cube shadow map at resolution {0}")]
    CubeAtlasFull(u32),

    // ========================================================================
    // Occlusion Errors
    // ========================================================================
    /// The per-view occlusion query pool is exhausted.
    #[error("Occlusion query dropped: pool of {capacity} queries exhausted")]
    QueryDropped {
        /// Pool capacity
        capacity: usize,
    },

    // ========================================================================
    // Command Ring & Render Thread Errors
    // ========================================================================
    /// A single command exceeds the ring buffer capacity.
    #[error("Render command of {size} bytes exceeds ring capacity of {capacity} bytes")]
    CommandTooLarge {
        /// Encoded command size
        size: usize,
        /// Ring capacity
        capacity: usize,
    },

    /// The consumer side of the command ring has gone away.
    #[error("Render command ring disconnected")]
    RingDisconnected,

    /// The render thread panicked while executing a command.
    #[error("Render thread panicked: {0}")]
    RenderThreadPanicked(String),

    /// The render thread is no longer healthy.
    #[error("Render thread unhealthy: {0}")]
    RenderThreadUnhealthy(String),

    /// The render thread could not be spawned or joined.
    #[error("Render thread error: {0}")]
    ThreadError(#[from] std::io::Error),

    // ========================================================================
    // Device Errors
    // ========================================================================
    /// The device rejected a resource creation request.
    #[error("Device error: {0}")]
    Device(String),
}

impl ShadowError {
    /// Returns `true` for errors that must stop the frame loop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AtlasOverlap { .. }
                | Self::CommandTooLarge { .. }
                | Self::RenderThreadPanicked(_)
                | Self::RenderThreadUnhealthy(_)
        )
    }
}

/// Alias for `Result<T, ShadowError>`.
pub type Result<T> = std::result::Result<T, ShadowError>;

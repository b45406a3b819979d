//! Occlusion History
//!
//! Per-view rolling record of GPU occlusion query results.
//!
//! Query results are read back `N` frames after they were issued, where `N`
//! is [`GpuCapabilities::occlusion_buffered_frames`](crate::settings::GpuCapabilities::occlusion_buffered_frames).
//! Each history keeps a ring of `N` pending queries indexed by
//! `frame % N`, so the slot read this frame is the one written `N` frames
//! ago and is immediately refilled.
//!
//! ```text
//!   frame F        F+1        ...       F+N
//!   issue q[s] ──────────────────────► read q[s], issue q'[s]
//! ```
//!
//! # Decisions
//!
//! | State                                   | Result                      |
//! |-----------------------------------------|-----------------------------|
//! | first sight                             | visible, indefinite         |
//! | pending query returned 0 pixels         | occluded, definite          |
//! | pending query returned > 0 pixels       | visible, definite           |
//! | no pending query                        | visible iff seen within TTL |
//! | bounds contain the view origin          | visible, definite, no query |
//! | query pool exhausted                    | visible, indefinite, warned |

use glam::Vec3;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};

use crate::errors::{Result, ShadowError};
use crate::math::bounds::{Aabb, BoxSphereBounds};
use crate::rhi::{QueryHandle, RenderDevice, ShaderState, VertexShader};
use crate::scene::{LightId, PrimitiveId};
use crate::settings::ShadowSettings;

/// Primitives sharing one grouped query.
pub const MAX_GROUPED_QUERY_SIZE: usize = 8;

/// Seed of the re-query stream; fixed so runs are reproducible.
const REQUERY_SEED: u64 = 42;

/// What an occlusion history tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OcclusionKey {
    Primitive(PrimitiveId),
    /// The receiver volume of a per-object shadow or preshadow.
    Shadow {
        primitive: PrimitiveId,
        light: LightId,
        preshadow: bool,
    },
}

impl OcclusionKey {
    #[must_use]
    pub fn primitive(&self) -> PrimitiveId {
        match *self {
            Self::Primitive(primitive) | Self::Shadow { primitive, .. } => primitive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcclusionResult {
    pub occluded: bool,
    /// Whether the result comes from a query (or a geometric test) rather
    /// than being assumed.
    pub definite: bool,
}

/// One occlusion test request.
#[derive(Debug, Clone, Copy)]
pub struct OcclusionTest {
    pub key: OcclusionKey,
    pub bounds: BoxSphereBounds,
    /// May share a query with up to [`MAX_GROUPED_QUERY_SIZE`] others.
    pub allow_grouping: bool,
    /// Bounds may cross the near plane; only a view origin strictly
    /// inside them skips the query.
    pub ignore_near_plane: bool,
}

// ============================================================================
// Query pool
// ============================================================================

/// Fixed-capacity pool of device queries.
#[derive(Debug)]
pub struct OcclusionQueryPool {
    free: Vec<QueryHandle>,
    created: usize,
    capacity: usize,
}

impl OcclusionQueryPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            created: 0,
            capacity,
        }
    }

    pub fn allocate(&mut self, device: &mut dyn RenderDevice) -> Result<QueryHandle> {
        if let Some(query) = self.free.pop() {
            return Ok(query);
        }
        if self.created >= self.capacity {
            return Err(ShadowError::QueryDropped {
                capacity: self.capacity,
            });
        }
        let query = device.create_occlusion_query()?;
        self.created += 1;
        Ok(query)
    }

    pub fn release(&mut self, query: QueryHandle) {
        self.free.push(query);
    }

    /// Queries currently handed out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.created - self.free.len()
    }

    pub fn destroy_all(&mut self, device: &mut dyn RenderDevice) {
        for query in self.free.drain(..) {
            device.destroy_occlusion_query(query);
        }
        self.created = 0;
    }
}

// ============================================================================
// Histories
// ============================================================================

#[derive(Debug, Clone)]
struct OcclusionHistory {
    pending: SmallVec<[Option<QueryHandle>; 4]>,
    last_visible_time: f32,
    last_considered_time: f32,
    last_pixel_fraction: f32,
    was_occluded: bool,
    /// The last scheduled query was never issued.
    query_dropped: bool,
}

impl OcclusionHistory {
    fn new(buffered_frames: usize, now: f32) -> Self {
        Self {
            pending: smallvec![None; buffered_frames],
            last_visible_time: now,
            last_considered_time: now,
            last_pixel_fraction: 0.0,
            was_occluded: false,
            query_dropped: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QueryRequest {
    key: OcclusionKey,
    bounds: Aabb,
}

/// Per-frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OcclusionStats {
    pub individual_queries: usize,
    pub grouped_queries: usize,
    pub dropped_queries: usize,
    pub skipped_requeries: usize,
}

/// Occlusion state of one view.
#[derive(Debug)]
pub struct ViewOcclusionState {
    histories: FxHashMap<OcclusionKey, OcclusionHistory>,
    pool: OcclusionQueryPool,
    /// Outstanding references to grouped queries.
    group_refs: FxHashMap<QueryHandle, u32>,
    buffered_frames: usize,
    frame: u64,
    rng: StdRng,
    individual: Vec<QueryRequest>,
    grouped: Vec<QueryRequest>,
    warned_dropped: bool,
    stats: OcclusionStats,
}

impl ViewOcclusionState {
    #[must_use]
    pub fn new(buffered_frames: u32, pool_capacity: usize) -> Self {
        Self {
            histories: FxHashMap::default(),
            pool: OcclusionQueryPool::new(pool_capacity),
            group_refs: FxHashMap::default(),
            buffered_frames: buffered_frames.max(1) as usize,
            frame: 0,
            rng: StdRng::seed_from_u64(REQUERY_SEED),
            individual: Vec::new(),
            grouped: Vec::new(),
            warned_dropped: false,
            stats: OcclusionStats::default(),
        }
    }

    pub fn begin_frame(&mut self, frame: u64) {
        self.frame = frame;
        self.individual.clear();
        self.grouped.clear();
        self.warned_dropped = false;
        self.stats = OcclusionStats::default();
    }

    #[inline]
    fn slot(&self) -> usize {
        (self.frame % self.buffered_frames as u64) as usize
    }

    #[must_use]
    pub fn stats(&self) -> OcclusionStats {
        self.stats
    }

    #[must_use]
    pub fn history_count(&self) -> usize {
        self.histories.len()
    }

    #[must_use]
    pub fn has_history(&self, key: &OcclusionKey) -> bool {
        self.histories.contains_key(key)
    }

    /// Queries handed out and not yet returned to the pool.
    #[must_use]
    pub fn outstanding_queries(&self) -> usize {
        self.pool.outstanding()
    }

    /// Pending queries of `key`, at most one per buffered frame.
    #[must_use]
    pub fn pending_query_count(&self, key: &OcclusionKey) -> usize {
        self.histories
            .get(key)
            .map_or(0, |h| h.pending.iter().flatten().count())
    }

    fn release_query(&mut self, query: QueryHandle) {
        if let Some(refs) = self.group_refs.get_mut(&query) {
            *refs -= 1;
            if *refs > 0 {
                return;
            }
            self.group_refs.remove(&query);
        }
        self.pool.release(query);
    }

    /// Determines this frame's occlusion state of `test.key` and schedules
    /// its next query.
    ///
    /// `view_pixels` is the view area, used to turn pixel counts into the
    /// screen fraction that drives re-query probability.
    pub fn update_and_query(
        &mut self,
        device: &mut dyn RenderDevice,
        test: &OcclusionTest,
        view_origin: Vec3,
        near_clip: f32,
        view_pixels: u64,
        now: f32,
        settings: &ShadowSettings,
    ) -> OcclusionResult {
        let slot = self.slot();
        let buffered = self.buffered_frames;
        let first_sight = !self.histories.contains_key(&test.key);
        let history = self
            .histories
            .entry(test.key)
            .or_insert_with(|| OcclusionHistory::new(buffered, now));
        history.last_considered_time = now;

        let pending = history.pending[slot].take();
        let mut result = match pending.map(|query| (query, device.read_occlusion_query(query, true))) {
            Some((_, Some(0))) => OcclusionResult {
                occluded: true,
                definite: true,
            },
            Some((_, Some(pixels))) => {
                history.last_pixel_fraction = pixels as f32 / view_pixels.max(1) as f32;
                history.last_visible_time = now;
                OcclusionResult {
                    occluded: false,
                    definite: true,
                }
            }
            _ if first_sight || history.query_dropped => OcclusionResult {
                occluded: false,
                definite: false,
            },
            _ => OcclusionResult {
                occluded: now - history.last_visible_time > settings.primitive_probably_visible_time,
                definite: false,
            },
        };
        if let Some(query) = pending {
            self.release_query(query);
        }

        // Bounds around the eye can't be tested by rasterizing them.
        let aabb = test.bounds.aabb();
        let eye_inside = if test.ignore_near_plane {
            aabb.contains_point(view_origin)
        } else {
            Aabb::from_center_extent(aabb.center(), aabb.extent() + Vec3::splat(near_clip))
                .contains_point(view_origin)
        };

        let Some(history) = self.histories.get_mut(&test.key) else {
            return result;
        };
        if eye_inside {
            result = OcclusionResult {
                occluded: false,
                definite: true,
            };
            history.last_visible_time = now;
            history.was_occluded = false;
            return result;
        }

        let request = QueryRequest {
            key: test.key,
            bounds: aabb,
        };
        if test.allow_grouping && history.was_occluded && result.occluded {
            self.grouped.push(request);
        } else if !result.occluded && result.definite {
            let max = settings.max_occlusion_pixels_fraction;
            let fraction = history.last_pixel_fraction;
            let probability = if fraction <= max { 1.0 } else { max / fraction };
            if probability >= 1.0 || self.rng.random_range(0.0..1.0f32) < probability {
                self.individual.push(request);
            } else {
                self.stats.skipped_requeries += 1;
            }
        } else {
            self.individual.push(request);
        }
        history.was_occluded = result.occluded;
        result
    }

    /// Issues every query scheduled this frame.
    pub fn submit_queries(&mut self, device: &mut dyn RenderDevice) {
        if self.individual.is_empty() && self.grouped.is_empty() {
            return;
        }
        device.bind_shaders(&ShaderState {
            vertex: VertexShader::OcclusionBounds,
            pixel: None,
            geometry: None,
            // The eye may sit inside a grouped box.
            cull_mode: None,
        });

        let slot = self.slot();
        let individual = std::mem::take(&mut self.individual);
        for (i, request) in individual.iter().enumerate() {
            let Some(query) = self.allocate(device) else {
                self.mark_dropped(&individual[i..]);
                break;
            };
            device.begin_occlusion_query(query);
            device.draw_occlusion_boxes(&[request.bounds]);
            device.end_occlusion_query(query);
            if let Some(history) = self.histories.get_mut(&request.key) {
                history.pending[slot] = Some(query);
                history.query_dropped = false;
            }
            self.stats.individual_queries += 1;
        }

        let grouped = std::mem::take(&mut self.grouped);
        for (i, batch) in grouped.chunks(MAX_GROUPED_QUERY_SIZE).enumerate() {
            let Some(query) = self.allocate(device) else {
                self.mark_dropped(&grouped[i * MAX_GROUPED_QUERY_SIZE..]);
                break;
            };
            let boxes: SmallVec<[Aabb; MAX_GROUPED_QUERY_SIZE]> =
                batch.iter().map(|r| r.bounds).collect();
            device.begin_occlusion_query(query);
            device.draw_occlusion_boxes(&boxes);
            device.end_occlusion_query(query);
            self.group_refs.insert(query, batch.len() as u32);
            for request in batch {
                if let Some(history) = self.histories.get_mut(&request.key) {
                    history.pending[slot] = Some(query);
                    history.query_dropped = false;
                }
            }
            self.stats.grouped_queries += 1;
        }
    }

    /// Untested requests read back as visible until a query goes through.
    fn mark_dropped(&mut self, requests: &[QueryRequest]) {
        for request in requests {
            if let Some(history) = self.histories.get_mut(&request.key) {
                history.query_dropped = true;
            }
        }
    }

    fn allocate(&mut self, device: &mut dyn RenderDevice) -> Option<QueryHandle> {
        match self.pool.allocate(device) {
            Ok(query) => Some(query),
            Err(err) => {
                self.stats.dropped_queries += 1;
                if !self.warned_dropped {
                    log::warn!("{err}; remaining primitives are treated as visible");
                    self.warned_dropped = true;
                }
                None
            }
        }
    }

    /// Drops histories not considered for `ttl` seconds.
    pub fn evict_stale(&mut self, now: f32, ttl: f32) {
        let stale: Vec<OcclusionKey> = self
            .histories
            .iter()
            .filter(|(_, h)| h.last_considered_time < now - ttl)
            .map(|(&key, _)| key)
            .collect();
        for key in stale {
            self.remove(&key);
        }
    }

    /// Drops every history that refers to `primitive`.
    pub fn forget_primitive(&mut self, primitive: PrimitiveId) {
        let keys: Vec<OcclusionKey> = self
            .histories
            .keys()
            .filter(|key| key.primitive() == primitive)
            .copied()
            .collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Drops every shadow history cast by `light`.
    pub fn forget_light(&mut self, light: LightId) {
        let keys: Vec<OcclusionKey> = self
            .histories
            .keys()
            .filter(|key| matches!(key, OcclusionKey::Shadow { light: l, .. } if *l == light))
            .copied()
            .collect();
        for key in keys {
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &OcclusionKey) {
        if let Some(history) = self.histories.remove(key) {
            for query in history.pending.into_iter().flatten() {
                self.release_query(query);
            }
        }
    }

    /// Releases every query back to the device.
    pub fn release(&mut self, device: &mut dyn RenderDevice) {
        let keys: Vec<OcclusionKey> = self.histories.keys().copied().collect();
        for key in keys {
            self.remove(&key);
        }
        self.pool.destroy_all(device);
    }
}

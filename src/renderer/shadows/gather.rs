//! Shadow Primitive Gatherer
//!
//! Fills the subject and receiver lists of every planned shadow with a
//! single walk of the primitive octree.
//!
//! Each shadow that needs scene primitives contributes a [`GatherVolume`].
//! An octree node is descended only when its loose bounds touch at least one
//! volume; every element of a visited node is then tested against each
//! volume in turn.
//!
//! | Shadow           | Subjects                                         | Receivers               |
//! |------------------|--------------------------------------------------|-------------------------|
//! | Per-object       | the subject itself                               | forward path only       |
//! | Self-shadow only | the subject itself                               | the subject             |
//! | Preshadow        | static casters inside the depth frustum          | the subject             |
//! | Cascade          | dynamic casters in the cylinder along the light  | -                       |
//! | Spot / cube face | dynamic casters inside the depth frustum         | -                       |
//! | One-pass point   | dynamic casters inside the light sphere          | -                       |
//! | Planar           | dynamic casters inside the depth frustum         | -                       |
//!
//! Subjects whose static meshes the main view already found visible reuse
//! them; other static meshes must be within their draw range from the
//! closest view. Primitives without static meshes are drawn dynamically.

use glam::Vec3;

use super::projected::{ProjectedShadow, ShadowKind, StaticMeshDraw};
use crate::math::bounds::{BoxSphereBounds, Sphere};
use crate::math::frustum::ConvexVolume;
use crate::scene::view::ViewInfo;
use crate::scene::{LightKey, PrimitiveFlags, PrimitiveId, PrimitiveKey, PrimitiveSceneInfo, Scene};
use crate::settings::{GpuCapabilities, ShadowSettings};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatherStats {
    pub nodes_visited: usize,
    pub nodes_pruned: usize,
    pub subjects: usize,
    pub static_draws: usize,
    pub dynamic_subjects: usize,
    pub receivers: usize,
}

/// Region of the scene a shadow collects primitives from.
#[derive(Debug, Clone)]
pub enum GatherVolume {
    Frustum(ConvexVolume),
    Sphere(Sphere),
    /// Infinite half-cylinder around a cascade sphere, open towards the light.
    Cylinder {
        center: Vec3,
        radius: f32,
        /// Direction the light travels.
        axis: Vec3,
    },
}

impl GatherVolume {
    #[must_use]
    pub fn intersects(&self, bounds: &BoxSphereBounds) -> bool {
        match self {
            Self::Frustum(frustum) => frustum.intersects_bounds(bounds),
            Self::Sphere(sphere) => {
                let r = sphere.radius + bounds.sphere_radius;
                sphere.center.distance_squared(bounds.origin) <= r * r
            }
            Self::Cylinder {
                center,
                radius,
                axis,
            } => {
                let reach = radius + bounds.sphere_radius;
                let offset = bounds.origin - *center;
                let along = offset.dot(*axis);
                let lateral_sq = (offset - along * *axis).length_squared();
                // Anything upstream of the split may occlude it.
                along <= reach && lateral_sq <= reach * reach
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatherRole {
    PreshadowSubject,
    WholeSceneSubject,
    ForwardReceiver,
}

#[derive(Debug)]
struct GatherRequest {
    shadow: usize,
    light: LightKey,
    role: GatherRole,
    volume: GatherVolume,
    /// Excluded from the results, e.g. the dynamic subject of a preshadow.
    exclude: Option<PrimitiveKey>,
    found: Vec<(PrimitiveId, PrimitiveKey)>,
}

fn request_for(
    index: usize,
    shadow: &ProjectedShadow,
    caps: GpuCapabilities,
) -> Option<GatherRequest> {
    let exclude = shadow.subject.map(|(key, _)| key);
    let (role, volume) = match shadow.kind {
        ShadowKind::PreShadow => (
            GatherRole::PreshadowSubject,
            GatherVolume::Frustum(shadow.subject_and_receiver_frustum.clone()),
        ),
        ShadowKind::PerObject if !caps.depth_textures && !shadow.self_shadow_only => (
            GatherRole::ForwardReceiver,
            GatherVolume::Frustum(shadow.receiver_frustum.clone()),
        ),
        ShadowKind::PerObject => return None,
        ShadowKind::WholeSceneCascade { .. } => {
            let bounds = shadow.whole_scene_bounds?;
            (
                GatherRole::WholeSceneSubject,
                GatherVolume::Cylinder {
                    center: bounds.center,
                    radius: bounds.radius,
                    axis: shadow.light_direction.normalize_or_zero(),
                },
            )
        }
        ShadowKind::OnePassPoint => (
            GatherRole::WholeSceneSubject,
            GatherVolume::Sphere(Sphere::new(
                shadow.light_origin,
                shadow.initializer.max_subject_depth,
            )),
        ),
        ShadowKind::WholeScene | ShadowKind::CubeFace { .. } | ShadowKind::PlanarReflection => (
            GatherRole::WholeSceneSubject,
            GatherVolume::Frustum(shadow.subject_and_receiver_frustum.clone()),
        ),
    };
    Some(GatherRequest {
        shadow: index,
        light: shadow.light,
        role,
        volume,
        exclude,
        found: Vec::new(),
    })
}

fn accepts(request: &GatherRequest, scene: &Scene, key: PrimitiveKey, primitive: &PrimitiveSceneInfo) -> bool {
    if request.exclude == Some(key) {
        return false;
    }
    let interaction = scene.interaction(request.light, key);
    match request.role {
        GatherRole::PreshadowSubject => {
            primitive.has(
                PrimitiveFlags::STATIC_SHADOWING
                    | PrimitiveFlags::CAST_STATIC_SHADOW
                    | PrimitiveFlags::CAST_DYNAMIC_SHADOW,
            ) && interaction.is_some_and(|i| i.has_shadow)
        }
        GatherRole::WholeSceneSubject => interaction.is_some_and(|i| i.has_shadow && i.is_dynamic),
        GatherRole::ForwardReceiver => interaction.is_some(),
    }
}

/// Collects subjects and receivers of `shadows`.
///
/// Lists are ordered by primitive id so the resulting draw order does not
/// depend on octree layout.
pub fn gather_shadow_primitives(
    shadows: &mut [ProjectedShadow],
    scene: &Scene,
    views: &[ViewInfo],
    settings: &ShadowSettings,
    caps: GpuCapabilities,
) -> GatherStats {
    let mut stats = GatherStats::default();

    let mut requests: Vec<GatherRequest> = shadows
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.depths_cached || s.kind == ShadowKind::PerObject)
        .filter_map(|(i, s)| request_for(i, s, caps))
        .collect();

    if !requests.is_empty() {
        let volumes: Vec<GatherVolume> = requests.iter().map(|r| r.volume.clone()).collect();
        scene.octree().traverse(
            |node| {
                let hit = volumes.iter().any(|v| v.intersects(node));
                if hit {
                    stats.nodes_visited += 1;
                } else {
                    stats.nodes_pruned += 1;
                }
                hit
            },
            |element| {
                let Some(primitive) = scene.primitive(element.primitive) else {
                    return;
                };
                for request in &mut requests {
                    if request.volume.intersects(&element.bounds)
                        && accepts(request, scene, element.primitive, primitive)
                    {
                        request.found.push((primitive.id(), element.primitive));
                    }
                }
            },
        );
    }

    // Per-object shadows draw exactly their subject.
    for shadow in shadows.iter_mut().filter(|s| s.kind == ShadowKind::PerObject) {
        let Some((key, _)) = shadow.subject else {
            continue;
        };
        let Some(primitive) = scene.primitive(key) else {
            continue;
        };
        let affected = scene
            .light(shadow.light)
            .is_some_and(|light| light.affects_bounds(primitive.bounds()));
        if affected {
            add_subject(shadow, key, primitive, views, settings, &mut stats);
            if shadow.self_shadow_only {
                shadow.receiver_primitives.push(key);
                stats.receivers += 1;
            }
        }
    }

    for mut request in requests {
        request.found.sort_unstable();
        request.found.dedup();
        let shadow = &mut shadows[request.shadow];
        match request.role {
            GatherRole::ForwardReceiver => {
                for (_, key) in request.found {
                    shadow.receiver_primitives.push(key);
                    stats.receivers += 1;
                }
            }
            GatherRole::PreshadowSubject | GatherRole::WholeSceneSubject => {
                for (_, key) in request.found {
                    if let Some(primitive) = scene.primitive(key) {
                        add_subject(shadow, key, primitive, views, settings, &mut stats);
                    }
                }
            }
        }
    }

    log::trace!(
        "Gathered {} subjects ({} static draws, {} dynamic) for {} shadows",
        stats.subjects,
        stats.static_draws,
        stats.dynamic_subjects,
        shadows.len()
    );
    stats
}

/// Adds one subject to `shadow`, choosing static or dynamic drawing.
fn add_subject(
    shadow: &mut ProjectedShadow,
    key: PrimitiveKey,
    primitive: &PrimitiveSceneInfo,
    views: &[ViewInfo],
    settings: &ShadowSettings,
    stats: &mut GatherStats,
) {
    shadow.subject_primitives.push(key);
    stats.subjects += 1;

    if primitive.static_meshes.is_empty() {
        if primitive.desc.dynamic_mesh.is_some() {
            shadow.dynamic_subjects.push(key);
            stats.dynamic_subjects += 1;
        }
        return;
    }

    let distance_sq = views
        .iter()
        .map(|view| {
            let factor = view.desc.lod_distance_factor;
            primitive.lod_distance_squared(view.desc.origin) * factor * factor
        })
        .fold(f32::INFINITY, f32::min);

    for mesh in primitive.static_meshes.iter().filter(|m| m.desc.cast_shadow) {
        let already_visible = views.iter().any(|view| view.static_mesh_visibility.contains(&mesh.id));
        if already_visible || mesh.in_draw_range(distance_sq, settings.max_draw_distance_scale) {
            shadow.static_mesh_draws.push(StaticMeshDraw {
                primitive: key,
                id: mesh.id,
                mesh: mesh.desc.mesh,
                masked: mesh.desc.masked,
                two_sided: mesh.desc.two_sided,
            });
            stats.static_draws += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cylinder_is_open_towards_the_light() {
        let volume = GatherVolume::Cylinder {
            center: Vec3::ZERO,
            radius: 10.0,
            axis: Vec3::NEG_Y,
        };
        let upstream = BoxSphereBounds::from_sphere(Vec3::new(0.0, 500.0, 0.0), 1.0);
        let downstream = BoxSphereBounds::from_sphere(Vec3::new(0.0, -500.0, 0.0), 1.0);
        let beside = BoxSphereBounds::from_sphere(Vec3::new(20.0, 0.0, 0.0), 1.0);
        assert!(volume.intersects(&upstream));
        assert!(!volume.intersects(&downstream));
        assert!(!volume.intersects(&beside));
    }

    #[test]
    fn sphere_volume_counts_subject_radius() {
        let volume = GatherVolume::Sphere(Sphere::new(Vec3::ZERO, 5.0));
        assert!(volume.intersects(&BoxSphereBounds::from_sphere(Vec3::new(6.0, 0.0, 0.0), 1.5)));
        assert!(!volume.intersects(&BoxSphereBounds::from_sphere(Vec3::new(7.0, 0.0, 0.0), 1.5)));
    }
}

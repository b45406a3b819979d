//! Render-side scene: arenas of lights and primitives, the interaction graph
//! between them and the octree used for spatial queries.
//!
//! All mutation goes through the methods here, which the command ring calls
//! in the order the scene thread issued them.

use glam::{Vec3, Vec4};
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::SlotMap;

use super::{
    LightDesc, LightId, LightKey, LightPrimitiveInteraction, LightSceneInfo, PrimitiveDesc,
    PrimitiveId, PrimitiveKey, PrimitiveOctree, PrimitiveSceneInfo, StaticMeshId,
};
use crate::errors::{Result, ShadowError};
use crate::math::bounds::BoxSphereBounds;
use crate::scene::primitive::StaticMesh;

#[derive(Debug, Default)]
pub struct Scene {
    lights: SlotMap<LightKey, LightSceneInfo>,
    primitives: SlotMap<PrimitiveKey, PrimitiveSceneInfo>,
    light_ids: FxHashMap<LightId, LightKey>,
    primitive_ids: FxHashMap<PrimitiveId, PrimitiveKey>,
    interactions: FxHashMap<(LightKey, PrimitiveKey), LightPrimitiveInteraction>,
    octree: PrimitiveOctree,

    next_static_mesh_id: u32,
    free_static_mesh_ids: Vec<StaticMeshId>,

    removed_primitives: Vec<PrimitiveId>,
    removed_lights: Vec<LightId>,
}

impl Scene {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn light(&self, key: LightKey) -> Option<&LightSceneInfo> {
        self.lights.get(key)
    }

    #[inline]
    #[must_use]
    pub fn primitive(&self, key: PrimitiveKey) -> Option<&PrimitiveSceneInfo> {
        self.primitives.get(key)
    }

    #[inline]
    pub fn primitive_mut(&mut self, key: PrimitiveKey) -> Option<&mut PrimitiveSceneInfo> {
        self.primitives.get_mut(key)
    }

    #[inline]
    #[must_use]
    pub fn light_key(&self, id: LightId) -> Option<LightKey> {
        self.light_ids.get(&id).copied()
    }

    #[inline]
    #[must_use]
    pub fn primitive_key(&self, id: PrimitiveId) -> Option<PrimitiveKey> {
        self.primitive_ids.get(&id).copied()
    }

    pub fn lights(&self) -> impl Iterator<Item = (LightKey, &LightSceneInfo)> {
        self.lights.iter()
    }

    pub fn primitives(&self) -> impl Iterator<Item = (PrimitiveKey, &PrimitiveSceneInfo)> {
        self.primitives.iter()
    }

    #[must_use]
    pub fn light_count(&self) -> usize {
        self.lights.len()
    }

    #[must_use]
    pub fn primitive_count(&self) -> usize {
        self.primitives.len()
    }

    #[must_use]
    pub fn interaction(
        &self,
        light: LightKey,
        primitive: PrimitiveKey,
    ) -> Option<&LightPrimitiveInteraction> {
        self.interactions.get(&(light, primitive))
    }

    pub fn interaction_mut(
        &mut self,
        light: LightKey,
        primitive: PrimitiveKey,
    ) -> Option<&mut LightPrimitiveInteraction> {
        self.interactions.get_mut(&(light, primitive))
    }

    /// Interactions of `light`, in primitive attach order.
    pub fn light_interactions(
        &self,
        light: LightKey,
    ) -> impl Iterator<Item = &LightPrimitiveInteraction> {
        self.lights
            .get(light)
            .map(|l| l.interactions.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(move |&p| self.interactions.get(&(light, p)))
    }

    #[inline]
    #[must_use]
    pub fn octree(&self) -> &PrimitiveOctree {
        &self.octree
    }

    /// Ids removed since the last call.
    pub fn take_removed(&mut self) -> (Vec<PrimitiveId>, Vec<LightId>) {
        (
            std::mem::take(&mut self.removed_primitives),
            std::mem::take(&mut self.removed_lights),
        )
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    pub fn add_primitive(&mut self, desc: PrimitiveDesc) -> Result<PrimitiveKey> {
        if self.primitive_ids.contains_key(&desc.id) {
            return Err(ShadowError::DuplicateId(desc.id.0));
        }
        let static_meshes = desc
            .static_meshes
            .iter()
            .map(|mesh| StaticMesh {
                id: self.allocate_static_mesh_id(),
                desc: mesh.clone(),
            })
            .collect();

        let id = desc.id;
        let bounds = desc.bounds;
        let key = self.primitives.insert(PrimitiveSceneInfo::new(desc, static_meshes));
        self.primitive_ids.insert(id, key);
        self.octree.insert(key, bounds);
        self.create_primitive_interactions(key);

        // A re-added id is no longer pending removal.
        self.removed_primitives.retain(|&removed| removed != id);
        log::debug!("Added primitive {id:?}");
        Ok(key)
    }

    pub fn remove_primitive(&mut self, id: PrimitiveId) -> Result<()> {
        let key = self
            .primitive_ids
            .remove(&id)
            .ok_or(ShadowError::UnknownPrimitive(id))?;
        self.remove_primitive_interactions(key);
        self.octree.remove(key);
        if let Some(info) = self.primitives.remove(key) {
            self.free_static_mesh_ids
                .extend(info.static_meshes.iter().map(|mesh| mesh.id));
        }
        self.removed_primitives.push(id);
        log::debug!("Removed primitive {id:?}");
        Ok(())
    }

    pub fn update_primitive_transform(
        &mut self,
        id: PrimitiveId,
        bounds: BoxSphereBounds,
    ) -> Result<()> {
        let key = self
            .primitive_key(id)
            .ok_or(ShadowError::UnknownPrimitive(id))?;
        if let Some(info) = self.primitives.get_mut(key) {
            info.desc.bounds = bounds;
        }
        self.octree.insert(key, bounds);

        // Keep fade state of interactions that survive the move.
        let previous: FxHashMap<LightKey, (f32, f32)> = self
            .interactions
            .iter()
            .filter(|((_, p), _)| *p == key)
            .map(|(&(l, _), i)| (l, (i.mod_shadow_start_fade_in, i.mod_shadow_start_fade_out)))
            .collect();
        self.remove_primitive_interactions(key);
        self.create_primitive_interactions(key);
        for (light, (fade_in, fade_out)) in previous {
            if let Some(interaction) = self.interactions.get_mut(&(light, key)) {
                interaction.mod_shadow_start_fade_in = fade_in;
                interaction.mod_shadow_start_fade_out = fade_out;
            }
        }
        Ok(())
    }

    /// Restricts the lights interacting with a primitive to `lights`.
    pub fn attach_light_environment(
        &mut self,
        primitive: PrimitiveId,
        lights: impl IntoIterator<Item = LightId>,
    ) -> Result<()> {
        let key = self
            .primitive_key(primitive)
            .ok_or(ShadowError::UnknownPrimitive(primitive))?;
        let environment: FxHashSet<LightId> = lights.into_iter().collect();
        if let Some(info) = self.primitives.get_mut(key) {
            info.light_environment = Some(environment);
        }
        self.remove_primitive_interactions(key);
        self.create_primitive_interactions(key);
        Ok(())
    }

    fn allocate_static_mesh_id(&mut self) -> StaticMeshId {
        self.free_static_mesh_ids.pop().unwrap_or_else(|| {
            let id = StaticMeshId(self.next_static_mesh_id);
            self.next_static_mesh_id += 1;
            id
        })
    }

    // ========================================================================
    // Lights
    // ========================================================================

    pub fn add_light(&mut self, desc: LightDesc) -> Result<LightKey> {
        if self.light_ids.contains_key(&desc.id) {
            return Err(ShadowError::DuplicateId(desc.id.0));
        }
        let id = desc.id;
        let key = self.lights.insert(LightSceneInfo::new(desc));
        self.light_ids.insert(id, key);
        self.create_light_interactions(key);
        self.removed_lights.retain(|&removed| removed != id);
        log::debug!("Added light {id:?}");
        Ok(key)
    }

    pub fn remove_light(&mut self, id: LightId) -> Result<()> {
        let key = self
            .light_ids
            .remove(&id)
            .ok_or(ShadowError::UnknownLight(id))?;
        let affected = self.remove_light_interactions(key);
        self.lights.remove(key);
        for primitive in affected {
            self.update_brightest_dominant_light(primitive);
        }
        self.removed_lights.push(id);
        log::debug!("Removed light {id:?}");
        Ok(())
    }

    pub fn update_light_transform(
        &mut self,
        id: LightId,
        position: Vec3,
        direction: Vec3,
    ) -> Result<()> {
        let key = self.light_key(id).ok_or(ShadowError::UnknownLight(id))?;
        if let Some(light) = self.lights.get_mut(key) {
            light.desc.position = position;
            light.desc.direction = direction.normalize_or(light.desc.direction);
        }
        let affected = self.remove_light_interactions(key);
        self.create_light_interactions(key);
        for primitive in affected {
            self.update_brightest_dominant_light(primitive);
        }
        Ok(())
    }

    pub fn update_light_color_and_brightness(
        &mut self,
        id: LightId,
        color: Vec3,
        brightness: f32,
    ) -> Result<()> {
        let key = self.light_key(id).ok_or(ShadowError::UnknownLight(id))?;
        let Some(light) = self.lights.get_mut(key) else {
            return Err(ShadowError::UnknownLight(id));
        };
        light.desc.color = color;
        light.desc.brightness = brightness;
        if light.is_dominant() {
            let primitives = light.interactions.clone();
            for primitive in primitives {
                self.update_brightest_dominant_light(primitive);
            }
        }
        Ok(())
    }

    /// Replaces the color used by modulated shadows.
    pub fn update_mod_shadow_color(&mut self, id: LightId, color: Vec4) -> Result<()> {
        let key = self.light_key(id).ok_or(ShadowError::UnknownLight(id))?;
        if let Some(light) = self.lights.get_mut(key) {
            light.desc.mod_shadow_color = color;
        }
        Ok(())
    }

    // ========================================================================
    // Interactions
    // ========================================================================

    fn should_interact(light: &LightSceneInfo, primitive: &PrimitiveSceneInfo) -> bool {
        light.desc.lighting_channels.intersects(primitive.desc.lighting_channels)
            && primitive.accepts_light(light.id())
            && light.affects_bounds(primitive.bounds())
    }

    fn link(&mut self, light_key: LightKey, primitive_key: PrimitiveKey) {
        let (Some(light), Some(primitive)) =
            (self.lights.get(light_key), self.primitives.get(primitive_key))
        else {
            return;
        };
        let interaction =
            LightPrimitiveInteraction::new(light_key, light, primitive_key, primitive);
        self.interactions.insert((light_key, primitive_key), interaction);
        if let Some(light) = self.lights.get_mut(light_key) {
            light.interactions.push(primitive_key);
        }
        if let Some(primitive) = self.primitives.get_mut(primitive_key) {
            primitive.interactions.push(light_key);
        }
    }

    fn create_primitive_interactions(&mut self, key: PrimitiveKey) {
        let Some(primitive) = self.primitives.get(key) else {
            return;
        };
        let lights: Vec<LightKey> = self
            .lights
            .iter()
            .filter(|(_, light)| Self::should_interact(light, primitive))
            .map(|(light_key, _)| light_key)
            .collect();
        for light in lights {
            self.link(light, key);
        }
        self.update_brightest_dominant_light(key);
    }

    fn create_light_interactions(&mut self, key: LightKey) {
        let Some(light) = self.lights.get(key) else {
            return;
        };
        let mut candidates = Vec::new();
        let sphere = light.bounding_sphere();
        self.octree.traverse(
            |node| sphere.is_none_or(|s| s.intersects(&node.sphere())),
            |element| candidates.push(element.primitive),
        );
        // Attach order follows primitive arena order so results don't
        // depend on octree layout.
        candidates.sort_unstable();
        let primitives: Vec<PrimitiveKey> = candidates
            .into_iter()
            .filter(|&p| {
                self.primitives
                    .get(p)
                    .is_some_and(|primitive| Self::should_interact(light, primitive))
            })
            .collect();

        for &primitive in &primitives {
            self.link(key, primitive);
        }
        for primitive in primitives {
            self.update_brightest_dominant_light(primitive);
        }
    }

    fn remove_primitive_interactions(&mut self, key: PrimitiveKey) {
        let lights = self
            .primitives
            .get_mut(key)
            .map(|p| std::mem::take(&mut p.interactions))
            .unwrap_or_default();
        for light in lights {
            self.interactions.remove(&(light, key));
            if let Some(info) = self.lights.get_mut(light) {
                info.interactions.retain(|&p| p != key);
            }
        }
    }

    /// Unlinks every primitive from `key`, returning the affected primitives.
    fn remove_light_interactions(&mut self, key: LightKey) -> Vec<PrimitiveKey> {
        let primitives = self
            .lights
            .get_mut(key)
            .map(|l| std::mem::take(&mut l.interactions))
            .unwrap_or_default();
        for &primitive in &primitives {
            self.interactions.remove(&(key, primitive));
            if let Some(info) = self.primitives.get_mut(primitive) {
                info.interactions.retain(|&l| l != key);
            }
        }
        primitives
    }

    /// Picks the brightest dominant light at the primitive's bounds origin.
    fn update_brightest_dominant_light(&mut self, key: PrimitiveKey) {
        let Some(primitive) = self.primitives.get(key) else {
            return;
        };
        let origin = primitive.bounds().origin;
        let brightest = primitive
            .interactions
            .iter()
            .filter_map(|&l| self.lights.get(l).map(|light| (l, light)))
            .filter(|(_, light)| light.is_dominant())
            .map(|(l, light)| (l, light.intensity_at(origin)))
            .fold(None::<(LightKey, f32)>, |best, (l, intensity)| match best {
                Some((_, b)) if b >= intensity => best,
                _ => Some((l, intensity)),
            })
            .map(|(l, _)| l);
        if let Some(primitive) = self.primitives.get_mut(key) {
            primitive.brightest_dominant_light = brightest;
        }
    }
}

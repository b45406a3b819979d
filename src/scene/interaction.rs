use super::{LightFlags, LightKey, LightSceneInfo, PrimitiveFlags, PrimitiveKey, PrimitiveSceneInfo};

/// One edge of the light/primitive graph.
///
/// Created when a light affects a primitive and both are attached; removed
/// when either side detaches or the primitive moves out of range.
#[derive(Debug, Clone, PartialEq)]
pub struct LightPrimitiveInteraction {
    pub light: LightKey,
    pub primitive: PrimitiveKey,
    /// The light may cast a dynamic shadow from this primitive.
    pub has_shadow: bool,
    /// The primitive's lighting from this light is not precomputed.
    pub is_dynamic: bool,
    /// Fade alpha a modulated shadow resumes from when it becomes visible.
    pub mod_shadow_start_fade_in: f32,
    /// Fade alpha a modulated shadow resumes from when it becomes hidden.
    pub mod_shadow_start_fade_out: f32,
}

impl LightPrimitiveInteraction {
    #[must_use]
    pub fn new(
        light_key: LightKey,
        light: &LightSceneInfo,
        primitive_key: PrimitiveKey,
        primitive: &PrimitiveSceneInfo,
    ) -> Self {
        let lf = light.flags();
        let pf = primitive.flags();
        let is_dynamic = !(pf.contains(PrimitiveFlags::STATIC_SHADOWING)
            && lf.contains(LightFlags::STATIC_SHADOWING));
        let cast = lf.contains(LightFlags::CAST_SHADOWS) && pf.contains(PrimitiveFlags::CAST_SHADOW);
        let has_shadow = cast
            && if is_dynamic {
                lf.contains(LightFlags::CAST_DYNAMIC_SHADOWS)
                    && pf.contains(PrimitiveFlags::CAST_DYNAMIC_SHADOW)
            } else {
                // Statically shadowed pairs still need a dynamic shadow for
                // preshadows and dominant-light composition.
                lf.contains(LightFlags::CAST_STATIC_SHADOWS)
                    && pf.contains(PrimitiveFlags::CAST_STATIC_SHADOW)
            };

        Self {
            light: light_key,
            primitive: primitive_key,
            has_shadow,
            is_dynamic,
            mod_shadow_start_fade_in: 1.0,
            mod_shadow_start_fade_out: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use slotmap::SlotMap;

    use super::*;
    use crate::math::bounds::BoxSphereBounds;
    use crate::rhi::MeshHandle;
    use crate::scene::{LightDesc, PrimitiveDesc};

    #[test]
    fn static_pair_is_not_dynamic() {
        let mut lights: SlotMap<LightKey, ()> = SlotMap::with_key();
        let mut prims: SlotMap<PrimitiveKey, ()> = SlotMap::with_key();
        let light = LightSceneInfo::new(
            LightDesc::point(Vec3::ZERO, 10.0).with_flags(LightFlags::STATIC_SHADOWING),
        );
        let wall = PrimitiveSceneInfo::new(
            PrimitiveDesc::static_mesh(BoxSphereBounds::from_sphere(Vec3::X, 1.0), MeshHandle(1)),
            Vec::new(),
        );
        let i = LightPrimitiveInteraction::new(lights.insert(()), &light, prims.insert(()), &wall);
        assert!(!i.is_dynamic);
        assert!(i.has_shadow);
    }
}

//! Modifier volumes: world-space regions that rewrite the instances
//! they cover.
//!
//! A volume carries an ordered list of modifiers. Managers track which
//! modifiers of which attached volumes still have to run, and clear a
//! volume's pending flag only once every one of its modifiers has run.
//! Modifiers that need live entities stay pending until the manager
//! spawns.

use crate::index::InstanceHandle;
use crate::iteration::IterationContext;
use crate::math::{Aabb, QueryVolume, Sphere, Transform};

/// Geometric extent of one modifier volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeShape {
    Box(Aabb),
    Sphere(Sphere),
}

impl VolumeShape {
    /// Conservative axis-aligned bounds for grid registration.
    pub fn bounds(&self) -> Aabb {
        match self {
            VolumeShape::Box(aabb) => *aabb,
            VolumeShape::Sphere(sphere) => Aabb::from_center_half_extents(
                sphere.center,
                glam::Vec3::splat(sphere.radius),
            ),
        }
    }
}

impl QueryVolume for VolumeShape {
    fn contains_point(&self, point: glam::Vec3) -> bool {
        match self {
            VolumeShape::Box(aabb) => aabb.contains_point(point),
            VolumeShape::Sphere(sphere) => sphere.contains_point(point),
        }
    }

    fn intersects_box(&self, aabb: &Aabb) -> bool {
        match self {
            VolumeShape::Box(b) => b.intersects_box(aabb),
            VolumeShape::Sphere(s) => s.intersects_box(aabb),
        }
    }

    fn encloses_box(&self, aabb: &Aabb) -> bool {
        match self {
            VolumeShape::Box(b) => b.encloses_box(aabb),
            VolumeShape::Sphere(s) => s.encloses_box(aabb),
        }
    }
}

/// One edit applied to every instance a volume covers.
pub trait InstanceModifier {
    /// Whether this modifier can only run against spawned entities.
    /// Pending runs are held back until the manager spawns.
    fn requires_spawned_entities(&self) -> bool {
        false
    }

    /// Called once per covered instance. Mutations go through the
    /// iteration context.
    fn modify_instance(
        &self,
        handle: InstanceHandle,
        world_transform: &Transform,
        ctx: &mut IterationContext,
    );
}

/// Deletes every instance the volume covers, as if it was never
/// authored.
pub struct RemoveInstancesModifier;

impl InstanceModifier for RemoveInstancesModifier {
    fn modify_instance(
        &self,
        handle: InstanceHandle,
        _world_transform: &Transform,
        ctx: &mut IterationContext,
    ) {
        ctx.remove_instance_deferred(handle);
    }
}

/// A placed region plus the modifiers it applies.
pub struct ModifierVolume {
    pub shape: VolumeShape,
    pub modifiers: Vec<Box<dyn InstanceModifier>>,
}

impl ModifierVolume {
    pub fn new(shape: VolumeShape, modifiers: Vec<Box<dyn InstanceModifier>>) -> Self {
        debug_assert!(!modifiers.is_empty(), "modifier volume without modifiers");
        Self { shape, modifiers }
    }

    pub fn bounds(&self) -> Aabb {
        self.shape.bounds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_sphere_shape_bounds_cover_sphere() {
        let shape = VolumeShape::Sphere(Sphere::new(Vec3::new(10.0, 0.0, 0.0), 2.0));
        let bounds = shape.bounds();
        assert!(bounds.contains_point(Vec3::new(12.0, 0.0, 0.0)));
        assert!(bounds.contains_point(Vec3::new(8.0, 0.0, 0.0)));
        assert!(!bounds.contains_point(Vec3::new(13.0, 0.0, 0.0)));
    }

    #[test]
    fn test_shape_dispatch_matches_underlying_volume() {
        let aabb = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE);
        let box_shape = VolumeShape::Box(Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(4.0)));
        let sphere_shape = VolumeShape::Sphere(Sphere::new(Vec3::ZERO, 10.0));

        assert!(box_shape.encloses_box(&aabb));
        assert!(sphere_shape.encloses_box(&aabb));
        assert!(box_shape.intersects_box(&aabb));
        assert!(sphere_shape.contains_point(Vec3::ZERO));
    }
}

//! Math primitives shared across the instance lifecycle engine.
//!
//! Plain data structures with pure operations. Instance transforms are
//! stored in local space and composed with their manager's transform on
//! demand, so composition and bounds transformation need to be cheap.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Scale below which an instance slot is considered a tombstone.
pub const FREE_SLOT_SCALE_EPSILON: f32 = 1e-6;

/// Translation / rotation / scale transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }

    /// The tombstone marker used for freed instance slots.
    pub fn free_slot() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ZERO,
        }
    }

    /// A zero-scale transform marks a freed slot.
    pub fn is_free_slot(&self) -> bool {
        self.scale.length_squared() < FREE_SLOT_SCALE_EPSILON
    }

    /// True when composing with this transform is a pure translation.
    pub fn is_translation_only(&self) -> bool {
        self.rotation.abs_diff_eq(Quat::IDENTITY, 1e-6) && self.scale.abs_diff_eq(Vec3::ONE, 1e-6)
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.translation + self.rotation * (self.scale * point)
    }

    /// Composes `self * other` (apply `other` first, then `self`).
    pub fn mul_transform(&self, other: &Transform) -> Transform {
        Transform {
            translation: self.transform_point(other.translation),
            rotation: self.rotation * other.rotation,
            scale: self.scale * other.scale,
        }
    }

    /// Exact for unrotated or uniformly scaled transforms. A rotated
    /// non-uniform scale has no TRS inverse; manager transforms must
    /// stay within that family.
    pub fn inverse(&self) -> Transform {
        debug_assert!(
            self.rotation.abs_diff_eq(Quat::IDENTITY, 1e-6)
                || ((self.scale.x - self.scale.y).abs() < 1e-6
                    && (self.scale.y - self.scale.z).abs() < 1e-6),
            "TRS inverse of a rotated non-uniform scale is not exact"
        );
        let inv_rotation = self.rotation.inverse();
        let inv_scale = Vec3::new(
            if self.scale.x.abs() > f32::EPSILON { 1.0 / self.scale.x } else { 0.0 },
            if self.scale.y.abs() > f32::EPSILON { 1.0 / self.scale.y } else { 0.0 },
            if self.scale.z.abs() > f32::EPSILON { 1.0 / self.scale.z } else { 0.0 },
        );
        Transform {
            translation: inv_rotation * (inv_scale * -self.translation),
            rotation: inv_rotation,
            scale: inv_scale,
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// An inverted box that unions as the empty set.
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    pub fn contains_box(&self, other: &Aabb) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    /// Transforms all eight corners and re-fits an axis-aligned box.
    pub fn transformed(&self, transform: &Transform) -> Aabb {
        let corners = [
            Vec3::new(self.min.x, self.min.y, self.min.z),
            Vec3::new(self.max.x, self.min.y, self.min.z),
            Vec3::new(self.min.x, self.max.y, self.min.z),
            Vec3::new(self.max.x, self.max.y, self.min.z),
            Vec3::new(self.min.x, self.min.y, self.max.z),
            Vec3::new(self.max.x, self.min.y, self.max.z),
            Vec3::new(self.min.x, self.max.y, self.max.z),
            Vec3::new(self.max.x, self.max.y, self.max.z),
        ];
        let mut out = Aabb::empty();
        for corner in corners {
            let p = transform.transform_point(corner);
            out.min = out.min.min(p);
            out.max = out.max.max(p);
        }
        out
    }

    /// Squared distance from `point` to the closest point on the box.
    /// Zero when the point is inside.
    pub fn distance_squared_to_point(&self, point: Vec3) -> f32 {
        let closest = point.clamp(self.min, self.max);
        (closest - point).length_squared()
    }
}

/// Sphere query volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        (point - self.center).length_squared() <= self.radius * self.radius
    }

    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        aabb.distance_squared_to_point(self.center) <= self.radius * self.radius
    }

    pub fn contains_aabb(&self, aabb: &Aabb) -> bool {
        let corners = [
            Vec3::new(aabb.min.x, aabb.min.y, aabb.min.z),
            Vec3::new(aabb.max.x, aabb.min.y, aabb.min.z),
            Vec3::new(aabb.min.x, aabb.max.y, aabb.min.z),
            Vec3::new(aabb.max.x, aabb.max.y, aabb.min.z),
            Vec3::new(aabb.min.x, aabb.min.y, aabb.max.z),
            Vec3::new(aabb.max.x, aabb.min.y, aabb.max.z),
            Vec3::new(aabb.min.x, aabb.max.y, aabb.max.z),
            Vec3::new(aabb.max.x, aabb.max.y, aabb.max.z),
        ];
        corners.iter().all(|&c| self.contains_point(c))
    }
}

/// A world-space volume instances can be tested against.
///
/// `Intersect` succeeds when the instance origin lies inside the volume
/// or its transformed local bounds overlap it. `Enclosed` requires the
/// full transformed bounds to lie within the volume, so any instance
/// passing `Enclosed` also passes `Intersect`.
pub trait QueryVolume {
    fn contains_point(&self, point: Vec3) -> bool;
    fn intersects_box(&self, aabb: &Aabb) -> bool;
    fn encloses_box(&self, aabb: &Aabb) -> bool;
}

impl QueryVolume for Aabb {
    fn contains_point(&self, point: Vec3) -> bool {
        Aabb::contains_point(self, point)
    }

    fn intersects_box(&self, aabb: &Aabb) -> bool {
        self.intersects(aabb)
    }

    fn encloses_box(&self, aabb: &Aabb) -> bool {
        self.contains_box(aabb)
    }
}

impl QueryVolume for Sphere {
    fn contains_point(&self, point: Vec3) -> bool {
        Sphere::contains_point(self, point)
    }

    fn intersects_box(&self, aabb: &Aabb) -> bool {
        self.intersects_aabb(aabb)
    }

    fn encloses_box(&self, aabb: &Aabb) -> bool {
        self.contains_aabb(aabb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_slot_marker() {
        assert!(Transform::free_slot().is_free_slot());
        assert!(!Transform::IDENTITY.is_free_slot());
    }

    #[test]
    fn test_transform_compose_translation_only() {
        let manager = Transform::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let local = Transform::from_translation(Vec3::new(1.0, 2.0, 3.0));
        assert!(manager.is_translation_only());

        let composed = manager.mul_transform(&local);
        assert_eq!(composed.translation, Vec3::new(11.0, 2.0, 3.0));
    }

    #[test]
    fn test_transform_inverse_round_trip() {
        let t = Transform {
            translation: Vec3::new(5.0, -2.0, 1.0),
            rotation: Quat::from_rotation_y(0.7),
            scale: Vec3::splat(2.0),
        };
        let p = Vec3::new(3.0, 4.0, -1.0);
        let round_trip = t.inverse().transform_point(t.transform_point(p));
        assert!(round_trip.abs_diff_eq(p, 1e-4));
    }

    #[test]
    fn test_inverse_exact_for_unrotated_nonuniform_scale() {
        let t = Transform {
            translation: Vec3::new(1.0, 2.0, 3.0),
            rotation: Quat::IDENTITY,
            scale: Vec3::new(2.0, 4.0, 0.5),
        };
        let p = Vec3::new(-3.0, 5.0, 2.0);
        let round_trip = t.inverse().transform_point(t.transform_point(p));
        assert!(round_trip.abs_diff_eq(p, 1e-4));
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_inverse_rejects_rotated_nonuniform_scale() {
        let t = Transform {
            translation: Vec3::ZERO,
            rotation: Quat::from_rotation_y(0.5),
            scale: Vec3::new(1.0, 2.0, 3.0),
        };
        let _ = t.inverse();
    }

    #[test]
    fn test_aabb_distance_squared() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(aabb.distance_squared_to_point(Vec3::splat(0.5)), 0.0);
        assert_eq!(aabb.distance_squared_to_point(Vec3::new(3.0, 0.5, 0.5)), 4.0);
    }

    #[test]
    fn test_transformed_bounds_contain_original_corners() {
        let aabb = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let t = Transform {
            translation: Vec3::new(4.0, 0.0, 0.0),
            rotation: Quat::from_rotation_z(0.4),
            scale: Vec3::splat(1.5),
        };
        let world = aabb.transformed(&t);
        assert!(world.contains_point(t.transform_point(Vec3::splat(-1.0))));
        assert!(world.contains_point(t.transform_point(Vec3::splat(1.0))));
    }

    #[test]
    fn test_enclosed_implies_intersect_for_box_and_sphere() {
        let instance_bounds = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        let query_box = Aabb::new(Vec3::splat(-2.0), Vec3::splat(2.0));
        let query_sphere = Sphere::new(Vec3::ZERO, 3.0);

        assert!(query_box.encloses_box(&instance_bounds));
        assert!(query_box.intersects_box(&instance_bounds));
        assert!(query_sphere.encloses_box(&instance_bounds));
        assert!(query_sphere.intersects_box(&instance_bounds));
    }
}

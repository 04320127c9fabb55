//! Actor class catalog and exemplar cache.
//!
//! An exemplar captures everything the engine needs to know about one
//! actor class without constructing real actors: local mesh bounds,
//! the instanced-mesh components to create, and per-instance custom
//! data. Exemplars are expensive to build for real classes, so the
//! subsystem caches them weakly and rebuilds on demand.

use std::rc::{Rc, Weak};

use log::{debug, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::math::Aabb;
use crate::render::IsmComponentDescriptor;

/// Id of a registered actor class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorClassId(pub u32);

/// Static description of an actor class, including its parent link for
/// settings inheritance.
#[derive(Debug, Clone)]
pub struct ActorClassDescriptor {
    pub name: String,
    pub parent: Option<ActorClassId>,
    pub mesh_bounds: Aabb,
    pub visualization: Vec<IsmComponentDescriptor>,
    pub custom_data: Vec<f32>,
}

/// Registry of actor classes known to the engine.
#[derive(Default)]
pub struct ActorClassCatalog {
    classes: FxHashMap<ActorClassId, ActorClassDescriptor>,
}

impl ActorClassCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ActorClassId, descriptor: ActorClassDescriptor) {
        if self.classes.insert(id, descriptor).is_some() {
            warn!("actor class {:?} re-registered, replacing descriptor", id);
        }
    }

    pub fn get(&self, id: ActorClassId) -> Option<&ActorClassDescriptor> {
        self.classes.get(&id)
    }

    /// The class itself followed by its ancestors, most derived first.
    /// Cycles are broken by bailing once a class repeats.
    pub fn class_chain(&self, id: ActorClassId) -> Vec<ActorClassId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(class) = current {
            if chain.contains(&class) {
                warn!("actor class hierarchy cycle at {:?}", class);
                break;
            }
            chain.push(class);
            current = self.classes.get(&class).and_then(|d| d.parent);
        }
        chain
    }
}

/// Immutable exemplar data shared by every group of one class.
#[derive(Debug)]
pub struct ExemplarData {
    pub class: ActorClassId,
    pub local_bounds: Aabb,
    pub visualization: Vec<IsmComponentDescriptor>,
    pub custom_data: Vec<f32>,
}

/// Weak per-class cache of exemplars. Holding only weak references lets
/// exemplar data die with its last group; the next request rebuilds it.
#[derive(Default)]
pub struct ExemplarCache {
    cache: FxHashMap<ActorClassId, Weak<ExemplarData>>,
}

impl ExemplarCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &mut self,
        class: ActorClassId,
        catalog: &ActorClassCatalog,
    ) -> Option<Rc<ExemplarData>> {
        if let Some(weak) = self.cache.get(&class) {
            if let Some(live) = weak.upgrade() {
                return Some(live);
            }
        }

        let descriptor = catalog.get(class)?;
        debug!("building exemplar for class {:?} ({})", class, descriptor.name);
        let exemplar = Rc::new(ExemplarData {
            class,
            local_bounds: descriptor.mesh_bounds,
            visualization: descriptor.visualization.clone(),
            custom_data: descriptor.custom_data.clone(),
        });
        self.cache.insert(class, Rc::downgrade(&exemplar));
        Some(exemplar)
    }

    /// Drops the cached entry so the next request rebuilds from the
    /// catalog. Outstanding strong references keep the old data alive.
    pub fn unregister_class(&mut self, class: ActorClassId) {
        self.cache.remove(&class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn catalog_with(id: u32, parent: Option<u32>) -> ActorClassCatalog {
        let mut catalog = ActorClassCatalog::new();
        catalog.register(
            ActorClassId(id),
            ActorClassDescriptor {
                name: format!("class{}", id),
                parent: parent.map(ActorClassId),
                mesh_bounds: Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE),
                visualization: vec![IsmComponentDescriptor::default()],
                custom_data: vec![],
            },
        );
        catalog
    }

    #[test]
    fn test_cache_returns_same_rc_while_alive() {
        let catalog = catalog_with(1, None);
        let mut cache = ExemplarCache::new();

        let a = cache.get_or_create(ActorClassId(1), &catalog).unwrap();
        let b = cache.get_or_create(ActorClassId(1), &catalog).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_cache_rebuilds_after_last_reference_drops() {
        let catalog = catalog_with(1, None);
        let mut cache = ExemplarCache::new();

        let first = cache.get_or_create(ActorClassId(1), &catalog).unwrap();
        let first_ptr = Rc::as_ptr(&first);
        drop(first);

        let rebuilt = cache.get_or_create(ActorClassId(1), &catalog).unwrap();
        // The weak entry expired, so this is a fresh allocation.
        assert!(!std::ptr::eq(first_ptr, Rc::as_ptr(&rebuilt)) || Rc::strong_count(&rebuilt) == 1);
    }

    #[test]
    fn test_unknown_class_yields_none() {
        let catalog = ActorClassCatalog::new();
        let mut cache = ExemplarCache::new();
        assert!(cache.get_or_create(ActorClassId(9), &catalog).is_none());
    }

    #[test]
    fn test_class_chain_walks_parents() {
        let mut catalog = catalog_with(1, None);
        catalog.register(
            ActorClassId(2),
            ActorClassDescriptor {
                name: "derived".into(),
                parent: Some(ActorClassId(1)),
                mesh_bounds: Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE),
                visualization: vec![],
                custom_data: vec![],
            },
        );
        assert_eq!(catalog.class_chain(ActorClassId(2)), vec![ActorClassId(2), ActorClassId(1)]);
    }
}

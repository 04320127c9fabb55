//! Minimal entity store backing spawned instances.
//!
//! Each valid instance slot owns at most one entity while its manager is
//! in the spawned state. Entities carry a world transform, a back
//! reference to their instance slot, and the current representation
//! mode. Structural mutations requested during iteration go through the
//! deferred [`CommandBuffer`] and are applied in a later synchronous
//! phase.

mod commands;

pub use commands::{CommandBuffer, EntityCommand};

use serde::{Deserialize, Serialize};

use crate::index::InstanceHandle;
use crate::math::Transform;

/// Opaque entity id. Ids are recycled after destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity(pub u32);

impl Entity {
    pub const INVALID: Entity = Entity(u32::MAX);

    pub fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::INVALID
    }
}

/// How an entity is currently represented to the player.
///
/// `Batched` entities are drawn through their group's shared instanced
/// components; `Detailed` entities get full per-entity treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepresentationMode {
    Detailed,
    Batched,
}

/// SoA entity table. Parallel columns indexed by entity id.
pub struct EntityStore {
    transforms: Vec<Transform>,
    instance_handles: Vec<InstanceHandle>,
    modes: Vec<RepresentationMode>,
    alive: Vec<bool>,
    free: Vec<u32>,
    alive_count: usize,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            transforms: Vec::new(),
            instance_handles: Vec::new(),
            modes: Vec::new(),
            alive: Vec::new(),
            free: Vec::new(),
            alive_count: 0,
        }
    }

    pub fn spawn(&mut self, instance: InstanceHandle, transform: Transform) -> Entity {
        let id = if let Some(recycled) = self.free.pop() {
            let i = recycled as usize;
            self.transforms[i] = transform;
            self.instance_handles[i] = instance;
            self.modes[i] = RepresentationMode::Batched;
            self.alive[i] = true;
            recycled
        } else {
            self.transforms.push(transform);
            self.instance_handles.push(instance);
            self.modes.push(RepresentationMode::Batched);
            self.alive.push(true);
            (self.transforms.len() - 1) as u32
        };
        self.alive_count += 1;
        Entity(id)
    }

    pub fn destroy(&mut self, entity: Entity) -> bool {
        let i = entity.0 as usize;
        if !entity.is_valid() || i >= self.alive.len() || !self.alive[i] {
            return false;
        }
        self.alive[i] = false;
        self.instance_handles[i] = InstanceHandle::INVALID;
        self.free.push(entity.0);
        self.alive_count -= 1;
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        let i = entity.0 as usize;
        entity.is_valid() && i < self.alive.len() && self.alive[i]
    }

    pub fn alive_count(&self) -> usize {
        self.alive_count
    }

    pub fn transform(&self, entity: Entity) -> Option<&Transform> {
        if self.is_alive(entity) {
            Some(&self.transforms[entity.0 as usize])
        } else {
            None
        }
    }

    pub fn set_transform(&mut self, entity: Entity, transform: Transform) -> bool {
        if self.is_alive(entity) {
            self.transforms[entity.0 as usize] = transform;
            true
        } else {
            false
        }
    }

    pub fn instance_handle(&self, entity: Entity) -> Option<InstanceHandle> {
        if self.is_alive(entity) {
            Some(self.instance_handles[entity.0 as usize])
        } else {
            None
        }
    }

    pub fn representation_mode(&self, entity: Entity) -> Option<RepresentationMode> {
        if self.is_alive(entity) {
            Some(self.modes[entity.0 as usize])
        } else {
            None
        }
    }

    pub fn set_representation_mode(&mut self, entity: Entity, mode: RepresentationMode) -> bool {
        if self.is_alive(entity) {
            self.modes[entity.0 as usize] = mode;
            true
        } else {
            false
        }
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{InstanceIndex, ManagerHandle};
    use glam::Vec3;

    fn handle(slot: u16) -> InstanceHandle {
        InstanceHandle::new(
            ManagerHandle { index: 0, generation: 1 },
            0,
            InstanceIndex::new(slot),
        )
    }

    #[test]
    fn test_spawn_destroy_recycles_ids() {
        let mut store = EntityStore::new();
        let a = store.spawn(handle(0), Transform::IDENTITY);
        let b = store.spawn(handle(1), Transform::IDENTITY);
        assert_ne!(a, b);
        assert_eq!(store.alive_count(), 2);

        assert!(store.destroy(a));
        assert!(!store.is_alive(a));
        assert!(!store.destroy(a));
        assert_eq!(store.alive_count(), 1);

        let c = store.spawn(handle(2), Transform::IDENTITY);
        assert_eq!(c, a);
        assert_eq!(store.instance_handle(c), Some(handle(2)));
    }

    #[test]
    fn test_new_entities_start_batched() {
        let mut store = EntityStore::new();
        let e = store.spawn(handle(0), Transform::from_translation(Vec3::X));
        assert_eq!(store.representation_mode(e), Some(RepresentationMode::Batched));
        assert!(store.set_representation_mode(e, RepresentationMode::Detailed));
        assert_eq!(store.representation_mode(e), Some(RepresentationMode::Detailed));
    }

    #[test]
    fn test_dead_entity_queries_return_none() {
        let mut store = EntityStore::new();
        let e = store.spawn(handle(0), Transform::IDENTITY);
        store.destroy(e);
        assert_eq!(store.transform(e), None);
        assert_eq!(store.instance_handle(e), None);
        assert!(!store.set_transform(e, Transform::IDENTITY));
    }
}

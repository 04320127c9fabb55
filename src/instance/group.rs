//! One group of instances sharing an actor class and tag set.

use log::{error, warn};

use crate::entity::{Entity, EntityStore};
use crate::exemplar::{ActorClassId, ExemplarData};
use crate::index::{InstanceHandle, InstanceIndex, ManagerHandle};
use crate::instance::DeltaList;
use crate::lod::BulkLod;
use crate::math::{Aabb, Transform};
use crate::render::{IsmComponentDescriptor, IsmComponentId, RenderSink};
use crate::settings::CompiledClassSettings;

/// One set of instanced-mesh components drawing this group's batched
/// representation.
#[derive(Debug, Clone, Default)]
pub struct VisualizationInfo {
    pub descriptors: Vec<IsmComponentDescriptor>,
    pub components: Vec<IsmComponentId>,
}

/// Dense per-slot instance data for one (actor class, tag set) pair.
///
/// Slots are stable: removal tombstones a slot by zeroing its scale and
/// never shifts later slots, so an `InstanceIndex` handed out once
/// stays meaningful until an explicit compaction.
pub struct InstanceGroup {
    id: u16,
    class: ActorClassId,
    tags: Vec<String>,

    /// Local-space transforms, one per slot. Zero scale marks a free
    /// slot.
    instance_transforms: Vec<Transform>,
    /// Parallel to `instance_transforms`; valid only while spawned.
    entities: Vec<Entity>,
    /// Freed slots available for reuse, most recent last.
    free_slots: Vec<InstanceIndex>,
    num_valid: u32,

    pub deltas: DeltaList,
    /// Union of per-instance mesh bounds in manager-local space.
    local_bounds: Aabb,
    /// Single-instance mesh bounds from the exemplar.
    mesh_bounds: Aabb,
    pub bulk_lod: BulkLod,
    pub visualizations: Vec<VisualizationInfo>,
    pub settings: CompiledClassSettings,
    spawned: bool,
}

impl InstanceGroup {
    pub fn new(
        id: u16,
        class: ActorClassId,
        mut tags: Vec<String>,
        mesh_bounds: Aabb,
        settings: CompiledClassSettings,
    ) -> Self {
        tags.sort();
        tags.dedup();
        Self {
            id,
            class,
            tags,
            instance_transforms: Vec::new(),
            entities: Vec::new(),
            free_slots: Vec::new(),
            num_valid: 0,
            deltas: DeltaList::new(),
            local_bounds: Aabb::empty(),
            mesh_bounds,
            bulk_lod: BulkLod::Off,
            visualizations: Vec::new(),
            settings,
            spawned: false,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn class(&self) -> ActorClassId {
        self.class
    }

    pub fn matches(&self, class: ActorClassId, tags: &[String]) -> bool {
        if self.class != class {
            return false;
        }
        // Stored tags are sorted and deduplicated; normalize the query
        // the same way before comparing.
        let mut query: Vec<&String> = tags.iter().collect();
        query.sort();
        query.dedup();
        query.len() == self.tags.len() && query.iter().zip(&self.tags).all(|(q, t)| *q == t)
    }

    pub fn num_instances(&self) -> usize {
        self.instance_transforms.len()
    }

    pub fn num_valid_instances(&self) -> u32 {
        self.num_valid
    }

    pub fn free_slot_count(&self) -> u32 {
        (self.instance_transforms.len() - self.num_valid as usize) as u32
    }

    pub fn has_spawned_entities(&self) -> bool {
        self.spawned
    }

    pub fn local_bounds(&self) -> Aabb {
        self.local_bounds
    }

    pub fn mesh_bounds(&self) -> Aabb {
        self.mesh_bounds
    }

    pub fn is_valid_instance(&self, index: InstanceIndex) -> bool {
        index.is_valid()
            && index.as_usize() < self.instance_transforms.len()
            && !self.instance_transforms[index.as_usize()].is_free_slot()
    }

    pub fn instance_transform(&self, index: InstanceIndex) -> Option<&Transform> {
        if self.is_valid_instance(index) {
            Some(&self.instance_transforms[index.as_usize()])
        } else {
            None
        }
    }

    pub fn instance_transforms(&self) -> &[Transform] {
        &self.instance_transforms
    }

    pub fn entity(&self, index: InstanceIndex) -> Entity {
        self.entities
            .get(index.as_usize())
            .copied()
            .unwrap_or(Entity::INVALID)
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub(crate) fn set_entity(&mut self, index: InstanceIndex, entity: Entity) {
        if index.as_usize() >= self.entities.len() {
            self.entities.resize(index.as_usize() + 1, Entity::INVALID);
        }
        self.entities[index.as_usize()] = entity;
    }

    /// Adds an instance in manager-local space, reusing the most
    /// recently freed slot if any. Illegal once entities are spawned.
    pub fn add_instance(&mut self, local_transform: Transform) -> InstanceIndex {
        debug_assert!(
            !self.spawned,
            "add_instance on group {} after entity spawn",
            self.id
        );
        if self.spawned {
            error!("add_instance on group {} after entity spawn, ignoring", self.id);
            return InstanceIndex::NONE;
        }
        self.add_instance_unchecked(local_transform)
    }

    /// Runtime insertion path used by the manager, which takes care of
    /// spawning the matching entity when the group is already live.
    pub(crate) fn add_instance_unchecked(&mut self, local_transform: Transform) -> InstanceIndex {
        debug_assert!(
            !local_transform.is_free_slot(),
            "zero-scale transforms are reserved for free slots"
        );

        let index = if let Some(free) = self.free_slots.pop() {
            debug_assert!(self.instance_transforms[free.as_usize()].is_free_slot());
            self.instance_transforms[free.as_usize()] = local_transform;
            if free.as_usize() < self.entities.len() {
                self.entities[free.as_usize()] = Entity::INVALID;
            }
            free
        } else {
            if self.instance_transforms.len() >= u16::MAX as usize {
                error!("group {} is full ({} slots)", self.id, self.instance_transforms.len());
                return InstanceIndex::NONE;
            }
            self.instance_transforms.push(local_transform);
            InstanceIndex::from_usize(self.instance_transforms.len() - 1)
        };

        if self.spawned {
            self.entities
                .resize(self.instance_transforms.len(), Entity::INVALID);
        }
        self.num_valid += 1;
        self.local_bounds = self
            .local_bounds
            .union(&self.mesh_bounds.transformed(&local_transform));
        index
    }

    /// Tombstones a slot. Later slots keep their indices. Returns false
    /// when the index is out of range or already free.
    pub fn remove_instance(&mut self, index: InstanceIndex) -> bool {
        if !self.is_valid_instance(index) {
            return false;
        }
        self.instance_transforms[index.as_usize()] = Transform::free_slot();
        self.free_slots.push(index);
        self.num_valid -= 1;
        true
    }

    /// Physically removes tombstones and reindexes the survivors.
    /// Invalidates every outstanding `InstanceIndex` into this group.
    /// Illegal once entities are spawned.
    pub fn compact_instances(&mut self) {
        debug_assert!(!self.spawned, "compact_instances on group {} after spawn", self.id);
        if self.spawned {
            error!("compact_instances on group {} after entity spawn, ignoring", self.id);
            return;
        }

        let mut remap: Vec<Option<InstanceIndex>> = vec![None; self.instance_transforms.len()];
        let mut write = 0usize;
        for read in 0..self.instance_transforms.len() {
            if self.instance_transforms[read].is_free_slot() {
                continue;
            }
            remap[read] = Some(InstanceIndex::from_usize(write));
            if write != read {
                self.instance_transforms[write] = self.instance_transforms[read];
            }
            write += 1;
        }
        self.instance_transforms.truncate(write);
        self.free_slots.clear();
        self.deltas
            .remap_slots(|old| remap.get(old.as_usize()).copied().flatten());
        debug_assert_eq!(self.num_valid as usize, write);
    }

    /// Spawns one entity per valid slot. Uses a translation-only
    /// composition when the manager transform allows it.
    pub fn spawn_entities(
        &mut self,
        manager: ManagerHandle,
        manager_transform: &Transform,
        entities: &mut EntityStore,
    ) {
        debug_assert!(!self.spawned, "double spawn on group {}", self.id);
        self.entities.clear();
        self.entities
            .resize(self.instance_transforms.len(), Entity::INVALID);

        let translation_only = manager_transform.is_translation_only();
        for (slot, local) in self.instance_transforms.iter().enumerate() {
            if local.is_free_slot() {
                continue;
            }
            let world = if translation_only {
                Transform {
                    translation: manager_transform.translation + local.translation,
                    rotation: local.rotation,
                    scale: local.scale,
                }
            } else {
                manager_transform.mul_transform(local)
            };
            let handle = InstanceHandle::new(manager, self.id, InstanceIndex::from_usize(slot));
            self.entities[slot] = entities.spawn(handle, world);
        }
        self.spawned = true;
    }

    /// Destroys all live entities, reading each one's world transform
    /// back into its slot first so physics drift survives despawn.
    pub fn despawn_entities(&mut self, manager_transform: &Transform, entities: &mut EntityStore) {
        if !self.spawned {
            return;
        }
        let inverse = manager_transform.inverse();
        for (slot, entity) in self.entities.iter_mut().enumerate() {
            if !entity.is_valid() {
                continue;
            }
            if let Some(world) = entities.transform(*entity) {
                self.instance_transforms[slot] = inverse.mul_transform(world);
            }
            entities.destroy(*entity);
            *entity = Entity::INVALID;
        }
        self.spawned = false;
    }

    /// Creates the instanced-mesh components for the exemplar's
    /// visualization and records them on the group.
    pub fn create_visualization(
        &mut self,
        exemplar: &ExemplarData,
        render: &mut dyn RenderSink,
    ) -> usize {
        let mut info = VisualizationInfo {
            descriptors: exemplar.visualization.clone(),
            components: Vec::with_capacity(exemplar.visualization.len()),
        };
        for descriptor in &exemplar.visualization {
            let mut descriptor = descriptor.clone();
            descriptor.cast_shadows = self.settings.instances_cast_shadows;
            info.components.push(render.create_component(&descriptor));
        }
        self.visualizations.push(info);
        self.visualizations.len() - 1
    }

    /// Pushes every valid instance's world transform to the batched
    /// components.
    pub fn push_batched_instances(
        &self,
        manager_transform: &Transform,
        render: &mut dyn RenderSink,
    ) {
        let transforms: Vec<Transform> = self
            .instance_transforms
            .iter()
            .filter(|t| !t.is_free_slot())
            .map(|t| manager_transform.mul_transform(t))
            .collect();
        for visualization in &self.visualizations {
            for &component in &visualization.components {
                render.clear_instances(component);
                render.add_instances(component, &transforms);
            }
        }
    }

    pub fn destroy_visualizations(&mut self, render: &mut dyn RenderSink) {
        for visualization in self.visualizations.drain(..) {
            for component in visualization.components {
                render.destroy_component(component);
            }
        }
    }

    /// Logs an occupancy report and flags degenerate groups.
    pub fn audit_instances(&self) {
        let free = self.free_slot_count();
        log::info!(
            "group {} class {:?}: {} slots, {} valid, {} free, {} deltas, lod {:?}",
            self.id,
            self.class,
            self.num_instances(),
            self.num_valid,
            free,
            self.deltas.len(),
            self.bulk_lod
        );
        if free > 0 && free >= self.num_valid {
            warn!(
                "group {} has more free slots ({}) than valid instances ({}), consider compaction",
                self.id, free, self.num_valid
            );
        }
    }
}

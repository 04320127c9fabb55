//! Managers own the instance groups inside one world-partition cell.
//!
//! A manager is placed once, accumulates instance data per actor class,
//! then spawns entities for every valid slot in a single five-phase
//! initialization. After registration its world bounds are frozen; the
//! subsystem's grid entry depends on them.

use bit_vec::BitVec;
use log::{debug, error, info, warn};

use crate::entity::EntityStore;
use crate::exemplar::{ActorClassId, ExemplarData};
use crate::index::{InstanceHandle, InstanceIndex, ManagerHandle, ModifierVolumeHandle};
use crate::instance::InstanceGroup;
use crate::iteration::{BoundsTestMode, IterationContext};
use crate::math::{Aabb, QueryVolume, Transform};
use crate::modifier::ModifierVolume;
use crate::render::RenderSink;
use crate::settings::CompiledClassSettings;
use crate::subsystem::GenArena;

/// A modifier volume attached to this manager, with per-modifier
/// pending state.
struct AttachedVolume {
    handle: ModifierVolumeHandle,
    pending_modifiers: BitVec,
}

impl AttachedVolume {
    fn is_pending(&self) -> bool {
        self.pending_modifiers.any()
    }
}

pub struct Manager {
    transform: Transform,
    groups: Vec<InstanceGroup>,
    next_group_id: u16,
    handle: Option<ManagerHandle>,
    /// Bounds override used for cell-aligned managers created at
    /// runtime. When unset, bounds derive from instance data.
    explicit_bounds: Option<Aabb>,
    /// Snapshot taken at registration; the grid entry uses it.
    registered_bounds: Option<Aabb>,
    volumes: Vec<AttachedVolume>,
    has_spawned_entities: bool,
}

impl Manager {
    pub fn new(transform: Transform) -> Self {
        Self {
            transform,
            groups: Vec::new(),
            next_group_id: 0,
            handle: None,
            explicit_bounds: None,
            registered_bounds: None,
            volumes: Vec::new(),
            has_spawned_entities: false,
        }
    }

    pub fn with_bounds(transform: Transform, bounds: Aabb) -> Self {
        let mut manager = Self::new(transform);
        manager.explicit_bounds = Some(bounds);
        manager
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn handle(&self) -> Option<ManagerHandle> {
        self.handle
    }

    pub fn has_spawned_entities(&self) -> bool {
        self.has_spawned_entities
    }

    /// World-space bounds covering every instance's mesh bounds.
    pub fn instance_bounds(&self) -> Aabb {
        if let Some(bounds) = self.explicit_bounds {
            return bounds;
        }
        let mut local = Aabb::empty();
        for group in &self.groups {
            let group_bounds = group.local_bounds();
            if group_bounds.is_valid() {
                local = local.union(&group_bounds);
            }
        }
        if local.is_valid() {
            local.transformed(&self.transform)
        } else {
            Aabb::from_center_half_extents(self.transform.translation, glam::Vec3::ZERO)
        }
    }

    pub(crate) fn on_registered(&mut self, handle: ManagerHandle) {
        debug_assert!(self.handle.is_none(), "manager registered twice");
        self.handle = Some(handle);
        self.registered_bounds = Some(self.instance_bounds());
    }

    pub(crate) fn on_unregistered(&mut self) {
        debug_assert!(
            self.registered_bounds
                .map_or(true, |b| b == self.instance_bounds() || self.explicit_bounds.is_some()),
            "manager bounds changed while registered"
        );
        self.handle = None;
        self.registered_bounds = None;
        self.volumes.clear();
    }

    pub(crate) fn registered_bounds(&self) -> Option<Aabb> {
        self.registered_bounds
    }

    // ---- groups ----------------------------------------------------

    /// Finds the group for `(class, tags)` or creates one, building its
    /// batched visualization from the exemplar.
    pub fn get_or_create_group(
        &mut self,
        class: ActorClassId,
        tags: Vec<String>,
        exemplar: &ExemplarData,
        settings: CompiledClassSettings,
        render: &mut dyn RenderSink,
    ) -> u16 {
        if let Some(group) = self.groups.iter().find(|g| g.matches(class, &tags)) {
            return group.id();
        }

        let id = self.next_group_id;
        debug_assert!(id != u16::MAX, "group id space exhausted");
        self.next_group_id += 1;

        let mut group = InstanceGroup::new(id, class, tags, exemplar.local_bounds, settings);
        group.create_visualization(exemplar, render);
        debug!("manager {:?}: created group {} for class {:?}", self.handle, id, class);
        self.groups.push(group);
        id
    }

    /// Group lookup by stable id. Groups are created with id == index,
    /// so the direct probe almost always hits; a linear scan covers
    /// reordered sets loaded from older data.
    pub fn find_group_by_id(&self, id: u16) -> Option<&InstanceGroup> {
        if let Some(group) = self.groups.get(id as usize) {
            if group.id() == id {
                return Some(group);
            }
        }
        self.groups.iter().find(|g| g.id() == id)
    }

    pub fn find_group_by_id_mut(&mut self, id: u16) -> Option<&mut InstanceGroup> {
        let direct = self
            .groups
            .get(id as usize)
            .map_or(false, |g| g.id() == id);
        if direct {
            return self.groups.get_mut(id as usize);
        }
        self.groups.iter_mut().find(|g| g.id() == id)
    }

    pub fn groups(&self) -> &[InstanceGroup] {
        &self.groups
    }

    pub(crate) fn groups_mut(&mut self) -> &mut [InstanceGroup] {
        &mut self.groups
    }

    // ---- instances -------------------------------------------------

    fn handle_or_invalid(&self) -> ManagerHandle {
        self.handle.unwrap_or(ManagerHandle::INVALID)
    }

    /// Adds an instance from a world-space transform during setup.
    pub fn add_instance(&mut self, group_id: u16, world_transform: Transform) -> InstanceHandle {
        let manager_handle = self.handle_or_invalid();
        let inverse = self.transform.inverse();
        let Some(group) = self.find_group_by_id_mut(group_id) else {
            error!("add_instance: unknown group {}", group_id);
            return InstanceHandle::INVALID;
        };
        let local = inverse.mul_transform(&world_transform);
        let index = group.add_instance(local);
        if !index.is_valid() {
            return InstanceHandle::INVALID;
        }
        InstanceHandle::new(manager_handle, group_id, index)
    }

    /// Runtime insertion: adds the instance and, when this manager has
    /// already spawned, spawns its entity immediately.
    pub(crate) fn instance_actor(
        &mut self,
        group_id: u16,
        world_transform: Transform,
        entities: &mut EntityStore,
    ) -> InstanceHandle {
        let manager_handle = self.handle_or_invalid();
        let spawned = self.has_spawned_entities;
        let transform = self.transform;
        let inverse = transform.inverse();
        let Some(group) = self.find_group_by_id_mut(group_id) else {
            error!("instance_actor: unknown group {}", group_id);
            return InstanceHandle::INVALID;
        };

        // A group created after this manager went live catches up here.
        if spawned && !group.has_spawned_entities() {
            group.spawn_entities(manager_handle, &transform, entities);
        }

        let local = inverse.mul_transform(&world_transform);
        let index = group.add_instance_unchecked(local);
        if !index.is_valid() {
            return InstanceHandle::INVALID;
        }
        let handle = InstanceHandle::new(manager_handle, group_id, index);
        if spawned {
            let entity = entities.spawn(handle, world_transform);
            group.set_entity(index, entity);
        }
        handle
    }

    pub fn is_valid_instance(&self, handle: InstanceHandle) -> bool {
        self.handle == Some(handle.manager)
            && self
                .find_group_by_id(handle.group_id)
                .map_or(false, |g| g.is_valid_instance(handle.index))
    }

    pub fn num_valid_instances(&self) -> u32 {
        self.groups.iter().map(|g| g.num_valid_instances()).sum()
    }

    pub fn has_any_valid_instances(&self) -> bool {
        self.groups.iter().any(|g| g.num_valid_instances() > 0)
    }

    /// Tombstones one instance and destroys its entity if spawned.
    pub fn runtime_remove_instance(
        &mut self,
        group_id: u16,
        index: InstanceIndex,
        entities: &mut EntityStore,
    ) -> bool {
        let Some(group) = self.find_group_by_id_mut(group_id) else {
            return false;
        };
        if !group.remove_instance(index) {
            return false;
        }
        let entity = group.entity(index);
        if entity.is_valid() {
            entities.destroy(entity);
            group.set_entity(index, crate::entity::Entity::INVALID);
        }
        true
    }

    pub fn runtime_remove_all_group_instances(&mut self, group_id: u16, entities: &mut EntityStore) {
        let Some(group) = self.find_group_by_id_mut(group_id) else {
            return;
        };
        let indices: Vec<InstanceIndex> = (0..group.num_instances())
            .map(InstanceIndex::from_usize)
            .filter(|&i| group.is_valid_instance(i))
            .collect();
        for index in indices {
            self.runtime_remove_instance(group_id, index, entities);
        }
    }

    pub fn runtime_remove_all_instances(&mut self, entities: &mut EntityStore) {
        let ids: Vec<u16> = self.groups.iter().map(|g| g.id()).collect();
        for id in ids {
            self.runtime_remove_all_group_instances(id, entities);
        }
    }

    // ---- spawn orchestration --------------------------------------

    /// Brings the manager live in five phases: groups are already
    /// initialized at creation, then pre-spawn modifiers, entity spawn,
    /// post-spawn modifiers, and finally buffered persistence deltas.
    pub fn initialize_modify_and_spawn_entities(
        &mut self,
        volumes: &GenArena<ModifierVolume>,
        entities: &mut EntityStore,
        render: &mut dyn RenderSink,
    ) {
        if self.has_spawned_entities {
            warn!("manager {:?} already spawned, skipping", self.handle);
            return;
        }
        let manager_handle = self.handle_or_invalid();

        self.try_run_pending_modifiers(volumes, entities);

        let transform = self.transform;
        for group in &mut self.groups {
            group.spawn_entities(manager_handle, &transform, entities);
            group.push_batched_instances(&transform, render);
        }
        self.has_spawned_entities = true;

        self.try_run_pending_modifiers(volumes, entities);

        self.apply_instance_deltas(entities);
    }

    /// Applies buffered persistence deltas: destroyed slots are removed
    /// (their entities with them). Lifecycle phase deltas stay resident
    /// on the group for gameplay systems to consume.
    fn apply_instance_deltas(&mut self, entities: &mut EntityStore) {
        let mut to_remove: Vec<(u16, InstanceIndex)> = Vec::new();
        for group in &self.groups {
            for delta in group.deltas.iter() {
                if delta.destroyed && group.is_valid_instance(delta.index) {
                    to_remove.push((group.id(), delta.index));
                }
            }
        }
        for (group_id, index) in to_remove {
            self.runtime_remove_instance(group_id, index, entities);
        }
    }

    pub fn despawn_all_entities(&mut self, entities: &mut EntityStore) {
        if !self.has_spawned_entities {
            return;
        }
        let transform = self.transform;
        for group in &mut self.groups {
            group.despawn_entities(&transform, entities);
        }
        self.has_spawned_entities = false;
    }

    // ---- iteration -------------------------------------------------

    fn iterate_group<F>(
        &self,
        group: &InstanceGroup,
        entities: &EntityStore,
        ctx: &mut IterationContext,
        bounds_test: Option<(&dyn QueryVolume, BoundsTestMode)>,
        op: &mut F,
    ) -> bool
    where
        F: FnMut(InstanceHandle, &Transform, &mut IterationContext) -> bool,
    {
        let manager_handle = self.handle_or_invalid();
        let mesh_bounds = group.mesh_bounds();

        let passes = |world: &Transform| -> bool {
            match bounds_test {
                None => true,
                Some((volume, BoundsTestMode::Intersect)) => {
                    volume.contains_point(world.translation)
                        || volume.intersects_box(&mesh_bounds.transformed(world))
                }
                Some((volume, BoundsTestMode::Enclosed)) => {
                    volume.encloses_box(&mesh_bounds.transformed(world))
                }
            }
        };

        if self.has_spawned_entities && group.has_spawned_entities() {
            for (slot, &entity) in group.entities().iter().enumerate() {
                if !entity.is_valid() {
                    continue;
                }
                let Some(world) = entities.transform(entity) else {
                    continue;
                };
                if !passes(world) {
                    continue;
                }
                let handle =
                    InstanceHandle::new(manager_handle, group.id(), InstanceIndex::from_usize(slot));
                if !op(handle, world, ctx) {
                    return false;
                }
            }
        } else {
            for (slot, local) in group.instance_transforms().iter().enumerate() {
                if local.is_free_slot() {
                    continue;
                }
                let world = self.transform.mul_transform(local);
                if !passes(&world) {
                    continue;
                }
                let handle =
                    InstanceHandle::new(manager_handle, group.id(), InstanceIndex::from_usize(slot));
                if !op(handle, &world, ctx) {
                    return false;
                }
            }
        }
        true
    }

    /// Visits every valid instance. `op` returns false to stop early;
    /// the return value reports whether the pass completed.
    pub fn for_each_instance<F>(
        &self,
        entities: &EntityStore,
        ctx: &mut IterationContext,
        mut op: F,
    ) -> bool
    where
        F: FnMut(InstanceHandle, &Transform, &mut IterationContext) -> bool,
    {
        for group in &self.groups {
            if !self.iterate_group(group, entities, ctx, None, &mut op) {
                return false;
            }
        }
        true
    }

    pub fn for_each_instance_filtered<F, G>(
        &self,
        entities: &EntityStore,
        ctx: &mut IterationContext,
        group_filter: G,
        mut op: F,
    ) -> bool
    where
        F: FnMut(InstanceHandle, &Transform, &mut IterationContext) -> bool,
        G: Fn(&InstanceGroup) -> bool,
    {
        for group in &self.groups {
            if !group_filter(group) {
                continue;
            }
            if !self.iterate_group(group, entities, ctx, None, &mut op) {
                return false;
            }
        }
        true
    }

    /// Visits instances whose bounds pass the volume test.
    pub fn for_each_instance_in_bounds<V, F>(
        &self,
        entities: &EntityStore,
        ctx: &mut IterationContext,
        volume: &V,
        mode: BoundsTestMode,
        mut op: F,
    ) -> bool
    where
        V: QueryVolume,
        F: FnMut(InstanceHandle, &Transform, &mut IterationContext) -> bool,
    {
        for group in &self.groups {
            if !self.iterate_group(group, entities, ctx, Some((volume, mode)), &mut op) {
                return false;
            }
        }
        true
    }

    // ---- modifier volumes -----------------------------------------

    /// Attaches a volume; all of its modifiers start pending.
    pub fn add_modifier_volume(&mut self, handle: ModifierVolumeHandle, volume: &ModifierVolume) {
        if self.volumes.iter().any(|v| v.handle == handle) {
            return;
        }
        self.volumes.push(AttachedVolume {
            handle,
            pending_modifiers: BitVec::from_elem(volume.modifiers.len(), true),
        });
    }

    pub fn remove_modifier_volume(&mut self, handle: ModifierVolumeHandle) -> bool {
        let before = self.volumes.len();
        self.volumes.retain(|v| v.handle != handle);
        self.volumes.len() != before
    }

    pub fn remove_all_modifier_volumes(&mut self) {
        self.volumes.clear();
    }

    pub fn has_pending_modifiers(&self) -> bool {
        self.volumes.iter().any(|v| v.is_pending())
    }

    /// Runs every pending modifier that can run now. Modifiers needing
    /// spawned entities stay pending until after spawn; a volume stops
    /// being pending only once all its modifiers have run.
    pub fn try_run_pending_modifiers(
        &mut self,
        volumes: &GenArena<ModifierVolume>,
        entities: &mut EntityStore,
    ) {
        if self.volumes.is_empty() {
            return;
        }

        for attached_index in 0..self.volumes.len() {
            let handle = self.volumes[attached_index].handle;
            let Some(volume) = volumes.get(handle.index, handle.generation) else {
                warn!("modifier volume {:?} vanished, dropping attachment", handle);
                self.volumes[attached_index].pending_modifiers.clear();
                continue;
            };

            for (modifier_index, modifier) in volume.modifiers.iter().enumerate() {
                if !self.volumes[attached_index]
                    .pending_modifiers
                    .get(modifier_index)
                    .unwrap_or(false)
                {
                    continue;
                }
                if modifier.requires_spawned_entities() && !self.has_spawned_entities {
                    continue;
                }

                let mut ctx = IterationContext::new();
                for group in &self.groups {
                    if group.settings.ignore_modifier_volumes {
                        continue;
                    }
                    let mode = if group.settings.modifier_volume_enclosed_test {
                        BoundsTestMode::Enclosed
                    } else {
                        BoundsTestMode::Intersect
                    };
                    self.iterate_group(
                        group,
                        entities,
                        &mut ctx,
                        Some((&volume.shape, mode)),
                        &mut |handle, world, ctx| {
                            modifier.modify_instance(handle, world, ctx);
                            true
                        },
                    );
                }
                ctx.flush_deferred_actions(self, entities);
                self.volumes[attached_index]
                    .pending_modifiers
                    .set(modifier_index, false);
            }
        }
    }

    // ---- diagnostics ----------------------------------------------

    pub fn audit_instances(&self) {
        info!(
            "manager {:?}: {} groups, {} valid instances, spawned={}",
            self.handle,
            self.groups.len(),
            self.num_valid_instances(),
            self.has_spawned_entities
        );
        for group in &self.groups {
            group.audit_instances();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exemplar::ExemplarData;
    use crate::math::Sphere;
    use crate::modifier::{RemoveInstancesModifier, VolumeShape};
    use crate::render::NullSink;
    use glam::Vec3;

    fn exemplar() -> ExemplarData {
        ExemplarData {
            class: ActorClassId(1),
            local_bounds: Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(0.5)),
            visualization: vec![Default::default()],
            custom_data: vec![],
        }
    }

    fn registered_manager() -> (Manager, u16) {
        let mut manager = Manager::new(Transform::IDENTITY);
        let mut render = NullSink::default();
        let group_id = manager.get_or_create_group(
            ActorClassId(1),
            vec![],
            &exemplar(),
            CompiledClassSettings::default(),
            &mut render,
        );
        manager.on_registered(ManagerHandle { index: 0, generation: 1 });
        (manager, group_id)
    }

    fn spawn(manager: &mut Manager, entities: &mut EntityStore) {
        let volumes = GenArena::new();
        let mut render = NullSink::default();
        manager.initialize_modify_and_spawn_entities(&volumes, entities, &mut render);
    }

    #[test]
    fn test_group_reuse_by_class_and_tags() {
        let (mut manager, group_id) = registered_manager();
        let mut render = NullSink::default();
        let again = manager.get_or_create_group(
            ActorClassId(1),
            vec![],
            &exemplar(),
            CompiledClassSettings::default(),
            &mut render,
        );
        assert_eq!(group_id, again);

        let other = manager.get_or_create_group(
            ActorClassId(1),
            vec!["burnt".into()],
            &exemplar(),
            CompiledClassSettings::default(),
            &mut render,
        );
        assert_ne!(group_id, other);
    }

    #[test]
    fn test_spawn_skips_tombstones() {
        let (mut manager, group_id) = registered_manager();
        let a = manager.add_instance(group_id, Transform::from_translation(Vec3::X));
        let _b = manager.add_instance(group_id, Transform::from_translation(Vec3::Y));
        let mut entities = EntityStore::new();
        manager.runtime_remove_instance(group_id, a.index, &mut entities);

        spawn(&mut manager, &mut entities);
        assert_eq!(entities.alive_count(), 1);
        assert!(manager.has_spawned_entities());
    }

    #[test]
    fn test_for_each_short_circuits() {
        let (mut manager, group_id) = registered_manager();
        for i in 0..5 {
            manager.add_instance(group_id, Transform::from_translation(Vec3::X * i as f32));
        }
        let entities = EntityStore::new();
        let mut ctx = IterationContext::new();
        let mut visited = 0;
        let completed = manager.for_each_instance(&entities, &mut ctx, |_, _, _| {
            visited += 1;
            visited < 3
        });
        assert!(!completed);
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_bounds_iteration_enclosed_subset_of_intersect() {
        let (mut manager, group_id) = registered_manager();
        // One instance well inside the sphere, one straddling its edge.
        manager.add_instance(group_id, Transform::from_translation(Vec3::ZERO));
        manager.add_instance(group_id, Transform::from_translation(Vec3::new(2.0, 0.0, 0.0)));
        let entities = EntityStore::new();
        let sphere = Sphere::new(Vec3::ZERO, 2.1);

        let count = |mode: BoundsTestMode| {
            let mut ctx = IterationContext::new();
            let mut n = 0;
            manager.for_each_instance_in_bounds(&entities, &mut ctx, &sphere, mode, |_, _, _| {
                n += 1;
                true
            });
            n
        };
        let intersecting = count(BoundsTestMode::Intersect);
        let enclosed = count(BoundsTestMode::Enclosed);
        assert_eq!(intersecting, 2);
        assert_eq!(enclosed, 1);
    }

    #[test]
    fn test_remove_modifier_runs_pre_spawn() {
        let (mut manager, group_id) = registered_manager();
        manager.add_instance(group_id, Transform::from_translation(Vec3::ZERO));
        manager.add_instance(group_id, Transform::from_translation(Vec3::new(100.0, 0.0, 0.0)));

        let mut volumes: GenArena<ModifierVolume> = GenArena::new();
        let (vi, vg) = volumes.insert(ModifierVolume::new(
            VolumeShape::Sphere(Sphere::new(Vec3::ZERO, 5.0)),
            vec![Box::new(RemoveInstancesModifier)],
        ));
        let volume_handle = ModifierVolumeHandle { index: vi, generation: vg };
        manager.add_modifier_volume(volume_handle, volumes.get(vi, vg).unwrap());
        assert!(manager.has_pending_modifiers());

        let mut entities = EntityStore::new();
        manager.try_run_pending_modifiers(&volumes, &mut entities);

        assert!(!manager.has_pending_modifiers());
        assert_eq!(manager.num_valid_instances(), 1);
    }

    #[test]
    fn test_persistence_deltas_applied_after_spawn() {
        let (mut manager, group_id) = registered_manager();
        let a = manager.add_instance(group_id, Transform::from_translation(Vec3::X));
        let _b = manager.add_instance(group_id, Transform::from_translation(Vec3::Y));
        manager
            .find_group_by_id_mut(group_id)
            .unwrap()
            .deltas
            .set_destroyed(a.index);

        let mut entities = EntityStore::new();
        spawn(&mut manager, &mut entities);

        assert_eq!(manager.num_valid_instances(), 1);
        assert_eq!(entities.alive_count(), 1);
        assert!(!manager.is_valid_instance(a));
    }
}

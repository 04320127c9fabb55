//! World-level registry and tick orchestration.
//!
//! The subsystem owns every manager and modifier volume through
//! generational arenas, keeps both spatially indexed, runs the deferred
//! spawn queue under a wall-clock budget, and drives the bulk LOD
//! scheduler off a time-ordered heap of per-group records.

mod arena;

pub use arena::GenArena;

use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::entity::{CommandBuffer, EntityStore, RepresentationMode};
use crate::exemplar::{ActorClassCatalog, ActorClassId, ExemplarCache, ExemplarData};
use crate::index::{InstanceHandle, ManagerHandle, ModifierVolumeHandle};
use crate::iteration::{BoundsTestMode, IterationContext};
use crate::lod::{
    classify_bulk_lod, min_viewer_distance_squared, next_tick_time, BulkLod, BulkLodMask,
    InstanceCountStats, NextTickEntry, Viewer, FORCED_LOW_LOD_LEVEL,
};
use crate::manager::Manager;
use crate::math::{Aabb, QueryVolume, Transform};
use crate::modifier::ModifierVolume;
use crate::persistence::{PersistenceRegistry, PersistenceResult};
use crate::render::RenderSink;
use crate::settings::{CompiledClassSettings, SettingsRegistry};
use crate::InstancedActorsConfig;

/// Grid cell key: coordinates plus the cell size they were derived
/// with, since per-class grid sizes may differ.
type CellKey = (i32, i32, i32, u32);

pub struct Subsystem {
    pub config: InstancedActorsConfig,

    managers: GenArena<Manager>,
    manager_grid: crate::spatial_index::HierarchicalHashGrid<ManagerHandle>,
    cell_managers: FxHashMap<CellKey, ManagerHandle>,

    volumes: GenArena<ModifierVolume>,
    volume_grid: crate::spatial_index::HierarchicalHashGrid<ModifierVolumeHandle>,
    pending_modifier_managers: Vec<ManagerHandle>,

    deferred_spawns: VecDeque<ManagerHandle>,

    lod_heap: BinaryHeap<NextTickEntry>,
    /// Groups absorbed into the tick heap, with the bucket and instance
    /// count last applied to the stats. Removal paths that bypass the
    /// subsystem settle up against this record at evaluation time.
    scheduled_groups: FxHashMap<(ManagerHandle, u16), (BulkLod, u32)>,
    dirty_instances: Vec<InstanceHandle>,
    viewers: Vec<Viewer>,
    stats: InstanceCountStats,
    rng: rand::rngs::StdRng,

    pub entities: EntityStore,
    pub commands: CommandBuffer,
    render: Box<dyn RenderSink>,

    pub catalog: ActorClassCatalog,
    pub settings: SettingsRegistry,
    compiled_settings: FxHashMap<ActorClassId, CompiledClassSettings>,
    exemplars: ExemplarCache,
    pub persistence: PersistenceRegistry,
}

impl Subsystem {
    pub fn new(
        config: InstancedActorsConfig,
        catalog: ActorClassCatalog,
        settings: SettingsRegistry,
        render: Box<dyn RenderSink>,
    ) -> Self {
        let manager_grid =
            crate::spatial_index::HierarchicalHashGrid::new(config.manager_grid_cell_size);
        let volume_grid =
            crate::spatial_index::HierarchicalHashGrid::new(config.modifier_volume_grid_cell_size);
        Self {
            config,
            managers: GenArena::new(),
            manager_grid,
            cell_managers: FxHashMap::default(),
            volumes: GenArena::new(),
            volume_grid,
            pending_modifier_managers: Vec::new(),
            deferred_spawns: VecDeque::new(),
            lod_heap: BinaryHeap::new(),
            scheduled_groups: FxHashMap::default(),
            dirty_instances: Vec::new(),
            viewers: Vec::new(),
            stats: InstanceCountStats::default(),
            rng: rand::rngs::StdRng::seed_from_u64(0x1A5D),
            entities: EntityStore::new(),
            commands: CommandBuffer::new(),
            render,
            catalog,
            settings,
            compiled_settings: FxHashMap::default(),
            exemplars: ExemplarCache::new(),
            persistence: PersistenceRegistry::new(),
        }
    }

    pub fn stats(&self) -> &InstanceCountStats {
        &self.stats
    }

    pub fn update_viewers(&mut self, viewers: Vec<Viewer>) {
        self.viewers = viewers;
    }

    // ---- managers --------------------------------------------------

    /// Registers a manager: arena slot, grid entry, modifier volume
    /// attachment, then immediate or deferred entity spawn.
    pub fn add_manager(&mut self, mut manager: Manager) -> ManagerHandle {
        debug_assert!(manager.handle().is_none(), "manager already registered");

        // Attach overlapping volumes before spawn so pre-spawn
        // modifiers run against authored data.
        let bounds_probe = manager.instance_bounds();
        let mut overlapping = Vec::new();
        self.volume_grid.query(&bounds_probe, &mut overlapping);
        for volume_handle in overlapping {
            if let Some(volume) = self.volumes.get(volume_handle.index, volume_handle.generation) {
                if volume.bounds().intersects(&bounds_probe) {
                    manager.add_modifier_volume(volume_handle, volume);
                }
            }
        }

        let (index, generation) = self.managers.insert(manager);
        let handle = ManagerHandle { index, generation };
        let manager = self
            .managers
            .get_mut(index, generation)
            .expect("freshly inserted manager");
        manager.on_registered(handle);
        let bounds = manager.registered_bounds().unwrap_or(bounds_probe);
        self.manager_grid.add(handle, &bounds);
        debug!("registered manager {:?} with bounds {:?}", handle, bounds);

        if self.config.defer_spawn_entities {
            self.request_deferred_spawn_entities(handle);
        } else {
            self.spawn_manager_entities(handle);
        }
        handle
    }

    /// Deregisters a manager: despawns its entities, drops its grid
    /// entry (keyed by the bounds recorded at registration) and frees
    /// the arena slot. Stale LOD heap records fall out lazily.
    pub fn remove_manager(&mut self, handle: ManagerHandle) -> bool {
        let Some(manager) = self.managers.get_mut(handle.index, handle.generation) else {
            return false;
        };
        manager.despawn_all_entities(&mut self.entities);
        for group in manager.groups_mut() {
            group.destroy_visualizations(self.render.as_mut());
        }
        let bounds = manager
            .registered_bounds()
            .unwrap_or_else(|| manager.instance_bounds());
        manager.on_unregistered();
        self.manager_grid.remove(handle, &bounds);
        self.cell_managers.retain(|_, &mut h| h != handle);
        let stats = &mut self.stats;
        self.scheduled_groups.retain(|&(h, _), &mut (lod, count)| {
            if h == handle {
                stats.add(lod, -(count as i64));
                false
            } else {
                true
            }
        });
        self.deferred_spawns.retain(|&h| h != handle);
        self.pending_modifier_managers.retain(|&h| h != handle);
        self.managers.remove(handle.index, handle.generation);
        debug!("removed manager {:?}", handle);
        true
    }

    pub fn manager(&self, handle: ManagerHandle) -> Option<&Manager> {
        self.managers.get(handle.index, handle.generation)
    }

    pub fn manager_mut(&mut self, handle: ManagerHandle) -> Option<&mut Manager> {
        self.managers.get_mut(handle.index, handle.generation)
    }

    pub fn num_managers(&self) -> usize {
        self.managers.len()
    }

    // ---- modifier volumes -----------------------------------------

    /// Registers a volume and attaches it to every overlapping
    /// registered manager. Spawned managers run the new modifiers
    /// immediately; pre-spawn managers pick them up during their spawn
    /// sequence or on the next tick.
    pub fn add_modifier_volume(&mut self, volume: ModifierVolume) -> ModifierVolumeHandle {
        let bounds = volume.bounds();
        let (index, generation) = self.volumes.insert(volume);
        let handle = ModifierVolumeHandle { index, generation };
        self.volume_grid.add(handle, &bounds);

        let mut overlapping = Vec::new();
        self.manager_grid.query(&bounds, &mut overlapping);
        let Self {
            ref mut managers,
            ref volumes,
            ref mut entities,
            ref mut pending_modifier_managers,
            ..
        } = *self;
        let volume = volumes.get(index, generation).expect("freshly inserted volume");
        for manager_handle in overlapping {
            let Some(manager) = managers.get_mut(manager_handle.index, manager_handle.generation)
            else {
                continue;
            };
            if !manager.instance_bounds().intersects(&bounds) {
                continue;
            }
            manager.add_modifier_volume(handle, volume);
            if manager.has_spawned_entities() {
                manager.try_run_pending_modifiers(volumes, entities);
            } else {
                pending_modifier_managers.push(manager_handle);
            }
        }
        handle
    }

    pub fn remove_modifier_volume(&mut self, handle: ModifierVolumeHandle) -> bool {
        let Some(volume) = self.volumes.get(handle.index, handle.generation) else {
            return false;
        };
        let bounds = volume.bounds();
        let mut overlapping = Vec::new();
        self.manager_grid.query(&bounds, &mut overlapping);
        for manager_handle in overlapping {
            if let Some(manager) = self.managers.get_mut(manager_handle.index, manager_handle.generation) {
                manager.remove_modifier_volume(handle);
            }
        }
        self.volume_grid.remove(handle, &bounds);
        self.volumes.remove(handle.index, handle.generation);
        true
    }

    pub fn modifier_volume(&self, handle: ModifierVolumeHandle) -> Option<&ModifierVolume> {
        self.volumes.get(handle.index, handle.generation)
    }

    // ---- deferred spawning ----------------------------------------

    pub fn request_deferred_spawn_entities(&mut self, handle: ManagerHandle) {
        if !self.deferred_spawns.contains(&handle) {
            self.deferred_spawns.push_back(handle);
        }
    }

    pub fn cancel_deferred_spawn_entities_request(&mut self, handle: ManagerHandle) -> bool {
        let before = self.deferred_spawns.len();
        self.deferred_spawns.retain(|&h| h != handle);
        self.deferred_spawns.len() != before
    }

    pub fn has_pending_deferred_spawn_entities_requests(&self) -> bool {
        !self.deferred_spawns.is_empty()
    }

    /// Spawns queued managers in FIFO order until `budget_seconds` of
    /// wall-clock time is spent. Always makes progress on at least one
    /// request. Returns the number of managers spawned.
    pub fn execute_pending_deferred_spawn_entities_requests(&mut self, budget_seconds: f64) -> usize {
        let start = Instant::now();
        let mut spawned = 0;
        while let Some(handle) = self.deferred_spawns.pop_front() {
            if !self.managers.contains(handle.index, handle.generation) {
                continue;
            }
            self.spawn_manager_entities(handle);
            spawned += 1;
            if start.elapsed().as_secs_f64() >= budget_seconds {
                break;
            }
        }
        if spawned > 0 {
            debug!(
                "deferred spawn: {} managers in {:.3}ms, {} still queued",
                spawned,
                start.elapsed().as_secs_f64() * 1e3,
                self.deferred_spawns.len()
            );
        }
        spawned
    }

    fn spawn_manager_entities(&mut self, handle: ManagerHandle) {
        let Self {
            ref mut managers,
            ref volumes,
            ref mut entities,
            ref mut render,
            ref mut lod_heap,
            ref mut scheduled_groups,
            ref mut stats,
            ..
        } = *self;
        let Some(manager) = managers.get_mut(handle.index, handle.generation) else {
            return;
        };
        manager.initialize_modify_and_spawn_entities(volumes, entities, render.as_mut());

        // Absorb this manager's group records into the tick heap with
        // an immediate evaluation time.
        for group in manager.groups() {
            let key = (handle, group.id());
            if !scheduled_groups.contains_key(&key) {
                let count = group.num_valid_instances();
                stats.add(group.bulk_lod, count as i64);
                scheduled_groups.insert(key, (group.bulk_lod, count));
                lod_heap.push(NextTickEntry {
                    time: 0.0,
                    manager: handle,
                    group_id: group.id(),
                });
            }
        }
    }

    // ---- exemplars and settings -----------------------------------

    pub fn get_or_create_exemplar(&mut self, class: ActorClassId) -> Option<Rc<ExemplarData>> {
        self.exemplars.get_or_create(class, &self.catalog)
    }

    pub fn unregister_exemplar_class(&mut self, class: ActorClassId) {
        self.exemplars.unregister_class(class);
        self.compiled_settings.remove(&class);
    }

    pub fn get_or_compile_settings_for_class(&mut self, class: ActorClassId) -> CompiledClassSettings {
        if let Some(compiled) = self.compiled_settings.get(&class) {
            return *compiled;
        }
        let compiled = self.settings.compile_for_class(class, &self.catalog);
        self.compiled_settings.insert(class, compiled);
        compiled
    }

    // ---- runtime placement ----------------------------------------

    /// Places one instance of `class` at a world transform, routing it
    /// to the manager owning the class's grid cell (created on first
    /// use).
    pub fn instance_actor(&mut self, class: ActorClassId, world_transform: Transform) -> InstanceHandle {
        let settings = self.get_or_compile_settings_for_class(class);
        let Some(exemplar) = self.get_or_create_exemplar(class) else {
            warn!("instance_actor: unknown class {:?}", class);
            return InstanceHandle::INVALID;
        };

        let grid_size = if settings.grid_size > 0.0 {
            settings.grid_size
        } else {
            self.config.default_grid_size
        };
        let cell = (
            (world_transform.translation.x / grid_size).floor() as i32,
            (world_transform.translation.y / grid_size).floor() as i32,
            (world_transform.translation.z / grid_size).floor() as i32,
            grid_size.to_bits(),
        );

        let manager_handle = match self.cell_managers.get(&cell) {
            Some(&handle) if self.managers.contains(handle.index, handle.generation) => handle,
            _ => {
                let cell_min = glam::Vec3::new(
                    cell.0 as f32 * grid_size,
                    cell.1 as f32 * grid_size,
                    cell.2 as f32 * grid_size,
                );
                let cell_bounds = Aabb::new(cell_min, cell_min + glam::Vec3::splat(grid_size));
                let manager = Manager::with_bounds(
                    Transform::from_translation(cell_bounds.center()),
                    cell_bounds,
                );
                let handle = self.add_manager(manager);
                self.cell_managers.insert(cell, handle);
                handle
            }
        };

        let Self {
            ref mut managers,
            ref mut entities,
            ref mut render,
            ref mut lod_heap,
            ref mut scheduled_groups,
            ref mut stats,
            ..
        } = *self;
        let Some(manager) = managers.get_mut(manager_handle.index, manager_handle.generation) else {
            return InstanceHandle::INVALID;
        };
        let group_id =
            manager.get_or_create_group(class, Vec::new(), &exemplar, settings, render.as_mut());
        let handle = manager.instance_actor(group_id, world_transform, entities);

        // Bump an already-scheduled group's bucket count, or absorb a
        // group born on an already-live manager into the tick heap.
        if handle.is_valid() && manager.has_spawned_entities() {
            match scheduled_groups.get_mut(&(manager_handle, group_id)) {
                Some((lod, count)) => {
                    stats.add(*lod, 1);
                    *count += 1;
                }
                None => {
                    let group = manager.find_group_by_id(group_id).expect("group just used");
                    let count = group.num_valid_instances();
                    stats.add(group.bulk_lod, count as i64);
                    scheduled_groups.insert((manager_handle, group_id), (group.bulk_lod, count));
                    lod_heap.push(NextTickEntry {
                        time: 0.0,
                        manager: manager_handle,
                        group_id,
                    });
                }
            }
        }
        handle
    }

    /// Removes a runtime-placed instance. Optionally tears the manager
    /// down once its last valid instance is gone.
    pub fn remove_actor_instance(&mut self, handle: InstanceHandle, destroy_manager_if_empty: bool) -> bool {
        let Some(manager) = self.managers.get_mut(handle.manager.index, handle.manager.generation)
        else {
            return false;
        };
        if !manager.runtime_remove_instance(handle.group_id, handle.index, &mut self.entities) {
            return false;
        }
        if let Some((lod, count)) = self
            .scheduled_groups
            .get_mut(&(handle.manager, handle.group_id))
        {
            self.stats.add(*lod, -1);
            *count = count.saturating_sub(1);
        }
        if destroy_manager_if_empty && !manager.has_any_valid_instances() {
            self.remove_manager(handle.manager);
        }
        true
    }

    // ---- spatial queries ------------------------------------------

    pub fn for_each_manager<F>(&self, bounds: &Aabb, mut op: F)
    where
        F: FnMut(ManagerHandle, &Manager) -> bool,
    {
        let mut candidates = Vec::new();
        self.manager_grid.query(bounds, &mut candidates);
        for handle in candidates {
            if let Some(manager) = self.managers.get(handle.index, handle.generation) {
                if manager.instance_bounds().intersects(bounds) && !op(handle, manager) {
                    return;
                }
            }
        }
    }

    pub fn for_each_modifier_volume<F>(&self, bounds: &Aabb, mut op: F)
    where
        F: FnMut(ModifierVolumeHandle, &ModifierVolume) -> bool,
    {
        let mut candidates = Vec::new();
        self.volume_grid.query(bounds, &mut candidates);
        for handle in candidates {
            if let Some(volume) = self.volumes.get(handle.index, handle.generation) {
                if volume.bounds().intersects(bounds) && !op(handle, volume) {
                    return;
                }
            }
        }
    }

    /// Visits every instance whose bounds pass the volume test, across
    /// all managers overlapping the query bounds.
    pub fn for_each_instance<V, F>(
        &self,
        query_bounds: &Aabb,
        volume: &V,
        mode: BoundsTestMode,
        ctx: &mut IterationContext,
        mut op: F,
    ) -> bool
    where
        V: QueryVolume,
        F: FnMut(InstanceHandle, &Transform, &mut IterationContext) -> bool,
    {
        let mut candidates = Vec::new();
        self.manager_grid.query(query_bounds, &mut candidates);
        for handle in candidates {
            if let Some(manager) = self.managers.get(handle.index, handle.generation) {
                if !manager.instance_bounds().intersects(query_bounds) {
                    continue;
                }
                if !manager.for_each_instance_in_bounds(&self.entities, ctx, volume, mode, &mut op) {
                    return false;
                }
            }
        }
        true
    }

    /// Applies a context's pending removals across all managers.
    pub fn flush_iteration_context(&mut self, ctx: &mut IterationContext) {
        let Self {
            ref mut managers,
            ref mut entities,
            ..
        } = *self;
        for (_, manager) in managers.iter_mut() {
            if ctx.is_empty() {
                break;
            }
            ctx.flush_deferred_actions(manager, entities);
        }
    }

    /// True when any instance of `class` in a bucket allowed by `mask`
    /// intersects `bounds`.
    pub fn has_instances_of_class(&self, bounds: &Aabb, class: ActorClassId, mask: BulkLodMask) -> bool {
        let mut found = false;
        self.for_each_manager(bounds, |handle, manager| {
            let matching: Vec<u16> = manager
                .groups()
                .iter()
                .filter(|g| g.class() == class && mask.contains(g.bulk_lod))
                .map(|g| g.id())
                .collect();
            if matching.is_empty() {
                return true;
            }
            let mut ctx = IterationContext::new();
            let completed = manager.for_each_instance_in_bounds(
                &self.entities,
                &mut ctx,
                bounds,
                BoundsTestMode::Intersect,
                |instance, _, _| {
                    if matching.contains(&instance.group_id) {
                        found = true;
                        return false;
                    }
                    true
                },
            );
            debug_assert!(handle.is_valid());
            completed
        });
        found
    }

    // ---- representation dirtying ----------------------------------

    /// Queues one instance's entity for a representation refresh on the
    /// next LOD pass (hydration/dehydration requests land here).
    pub fn mark_instance_representation_dirty(&mut self, handle: InstanceHandle) {
        self.dirty_instances.push(handle);
    }

    /// Takes the queued dirty instances, leaving the list empty. The
    /// LOD batch drains this itself; external callers can use it to run
    /// their own refresh pass instead.
    pub fn pop_all_dirty_representation_instances(&mut self) -> Vec<InstanceHandle> {
        std::mem::take(&mut self.dirty_instances)
    }

    // ---- LOD scheduling -------------------------------------------

    /// Forces a group's next evaluation to the front of the heap.
    pub fn update_and_reset_tick_time(&mut self, manager: ManagerHandle, group_id: u16) {
        if !self.scheduled_groups.contains_key(&(manager, group_id)) {
            return;
        }
        let mut entries: Vec<NextTickEntry> = self.lod_heap.drain().collect();
        for entry in &mut entries {
            if entry.manager == manager && entry.group_id == group_id {
                entry.time = 0.0;
            }
        }
        self.lod_heap = entries.into_iter().collect();
    }

    /// Re-evaluates every group whose scheduled time has come.
    pub fn run_lod_batch(&mut self, now: f64) {
        let Self {
            ref mut managers,
            ref mut lod_heap,
            ref mut scheduled_groups,
            ref mut dirty_instances,
            ref mut rng,
            ref mut render,
            ref mut commands,
            ref mut stats,
            ref viewers,
            ref config,
            ..
        } = *self;

        let mut due = Vec::new();
        while let Some(entry) = lod_heap.peek() {
            if entry.time > now {
                break;
            }
            due.push(lod_heap.pop().expect("peeked entry"));
        }

        for entry in due {
            let key = (entry.manager, entry.group_id);
            let Some(manager) = managers.get_mut(entry.manager.index, entry.manager.generation)
            else {
                if let Some((lod, count)) = scheduled_groups.remove(&key) {
                    stats.add(lod, -(count as i64));
                }
                continue;
            };
            let bounds = manager
                .registered_bounds()
                .unwrap_or_else(|| manager.instance_bounds());
            let Some(group) = manager.find_group_by_id_mut(entry.group_id) else {
                if let Some((lod, count)) = scheduled_groups.remove(&key) {
                    stats.add(lod, -(count as i64));
                }
                continue;
            };

            // Removals that bypassed the subsystem (modifier volumes,
            // iteration flushes) settle up against the stats here.
            let current = group.num_valid_instances();
            if let Some((lod, count)) = scheduled_groups.get_mut(&key) {
                if *count != current {
                    stats.add(*lod, current as i64 - *count as i64);
                    *count = current;
                }
            }

            let settings = group.settings;
            let forced_detailed = settings.detailed_representation_lod_distance;
            let distance_squared = min_viewer_distance_squared(
                viewers,
                &bounds,
                forced_detailed * forced_detailed,
            );
            let new_lod = classify_bulk_lod(distance_squared, &settings, config.lod_distance_scale);

            if new_lod != group.bulk_lod {
                let old_lod = group.bulk_lod;
                stats.apply_change(old_lod, new_lod, current as i64);
                if let Some((lod, _)) = scheduled_groups.get_mut(&key) {
                    *lod = new_lod;
                }

                let visible = new_lod != BulkLod::Off;
                let forced_level = if new_lod == BulkLod::Low {
                    Some(FORCED_LOW_LOD_LEVEL)
                } else {
                    None
                };
                for visualization in &group.visualizations {
                    for &component in &visualization.components {
                        render.set_visibility(component, visible);
                        render.set_forced_lod(component, forced_level);
                        if settings.control_physics_state {
                            render.set_physics_enabled(component, new_lod != BulkLod::Off);
                        }
                    }
                }

                let mode = if new_lod == BulkLod::Detailed {
                    RepresentationMode::Detailed
                } else {
                    RepresentationMode::Batched
                };
                for &entity in group.entities() {
                    if entity.is_valid() {
                        commands.set_representation_mode(entity, mode);
                    }
                }

                group.bulk_lod = new_lod;
                debug!(
                    "group {} on {:?}: {:?} -> {:?} (d2 {:.0})",
                    entry.group_id, entry.manager, old_lod, new_lod, distance_squared
                );
            }

            // Without a relevant viewer there is nothing to react to;
            // wait the longest delay regardless of bucket.
            let delay_lod = if distance_squared == f32::MAX {
                BulkLod::Off
            } else {
                group.bulk_lod
            };
            lod_heap.push(NextTickEntry {
                time: next_tick_time(now, delay_lod, rng.gen::<f64>()),
                manager: entry.manager,
                group_id: entry.group_id,
            });
        }

        // Dirty drain: force a representation refresh for entities of
        // groups currently outside the Detailed bucket.
        for handle in dirty_instances.drain(..) {
            let Some(manager) = managers.get(handle.manager.index, handle.manager.generation)
            else {
                continue;
            };
            let Some(group) = manager.find_group_by_id(handle.group_id) else {
                continue;
            };
            let entity = group.entity(handle.index);
            if !entity.is_valid() {
                continue;
            }
            let mode = if group.bulk_lod == BulkLod::Detailed {
                RepresentationMode::Detailed
            } else {
                RepresentationMode::Batched
            };
            commands.set_representation_mode(entity, mode);
        }
    }

    // ---- tick ------------------------------------------------------

    /// One cooperative tick: deferred spawns under budget, pending
    /// modifiers, LOD batch, then the entity command flush.
    pub fn tick(&mut self, now: f64) {
        if self.has_pending_deferred_spawn_entities_requests() {
            self.execute_pending_deferred_spawn_entities_requests(
                self.config.deferred_spawn_budget_seconds,
            );
        }

        let pending: Vec<ManagerHandle> = self.pending_modifier_managers.drain(..).collect();
        if !pending.is_empty() {
            let Self {
                ref mut managers,
                ref volumes,
                ref mut entities,
                ..
            } = *self;
            for handle in pending {
                if let Some(manager) = managers.get_mut(handle.index, handle.generation) {
                    manager.try_run_pending_modifiers(volumes, entities);
                }
            }
        }

        self.run_lod_batch(now);
        let Self {
            ref mut commands,
            ref mut entities,
            ..
        } = *self;
        commands.flush(entities);
    }

    // ---- persistence ----------------------------------------------

    /// Saves one manager, or `None` when persistence is disabled or
    /// this side lacks authority.
    pub fn save_manager_persistence(
        &self,
        handle: ManagerHandle,
        save_unix_time: u64,
    ) -> Option<PersistenceResult<Vec<u8>>> {
        if !self.config.persistence_enabled || !self.config.authority {
            return None;
        }
        let manager = self.manager(handle)?;
        Some(manager.save_persistence(&self.persistence, save_unix_time))
    }

    pub fn load_manager_persistence(
        &mut self,
        handle: ManagerHandle,
        data: &[u8],
        now_unix_time: u64,
    ) -> Option<PersistenceResult<()>> {
        if !self.config.persistence_enabled || !self.config.authority {
            return None;
        }
        let Self {
            ref mut managers,
            ref persistence,
            ..
        } = *self;
        let manager = managers.get_mut(handle.index, handle.generation)?;
        Some(manager.load_persistence(persistence, data, now_unix_time))
    }

    pub fn audit_instances(&self) {
        info!(
            "subsystem: {} managers, {} volumes, {} deferred spawns, {} scheduled groups",
            self.managers.len(),
            self.volumes.len(),
            self.deferred_spawns.len(),
            self.scheduled_groups.len()
        );
        for (_, manager) in self.managers.iter() {
            manager.audit_instances();
        }
    }
}

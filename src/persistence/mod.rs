//! Per-manager save and load.
//!
//! The on-disk record is a little-endian block format keyed by stable
//! group ids. Every group record and component block declares its byte
//! size up front, so a loader can skip groups that no longer exist and
//! component blocks it has no handler for without understanding their
//! contents. Lifecycle deltas carry elapsed-phase seconds; on load the
//! real time passed since the save is added on top, clamped to zero
//! against clock skew.

mod error;

pub use error::{PersistenceError, PersistenceResult};

use log::{debug, error as log_error, warn};

use crate::instance::{InstanceGroup, LIFECYCLE_PHASE_NONE};
use crate::index::InstanceIndex;
use crate::manager::Manager;

/// `IAPD` little-endian.
pub const PERSISTENCE_MAGIC: u32 = u32::from_le_bytes(*b"IAPD");
pub const PERSISTENCE_VERSION: u32 = 1;

/// Custom per-group payloads saved alongside the built-in delta
/// sections. Handlers are matched by a stable numeric id; payloads with
/// no registered handler are skipped by size on load.
pub trait ComponentPersistence {
    fn persistence_id(&self) -> u32;

    fn should_save(&self, _group: &InstanceGroup) -> bool {
        true
    }

    fn save(&self, group: &InstanceGroup, out: &mut Vec<u8>) -> PersistenceResult<()>;

    /// `elapsed_seconds` is the real time since the save.
    fn load(
        &self,
        group: &mut InstanceGroup,
        payload: &[u8],
        elapsed_seconds: f64,
    ) -> PersistenceResult<()>;
}

#[derive(Default)]
pub struct PersistenceRegistry {
    handlers: Vec<Box<dyn ComponentPersistence>>,
}

impl PersistenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Box<dyn ComponentPersistence>) {
        debug_assert!(
            !self.handlers.iter().any(|h| h.persistence_id() == handler.persistence_id()),
            "duplicate persistence id {}",
            handler.persistence_id()
        );
        self.handlers.push(handler);
    }

    fn find(&self, id: u32) -> Option<&dyn ComponentPersistence> {
        self.handlers
            .iter()
            .find(|h| h.persistence_id() == id)
            .map(|h| h.as_ref())
    }

    fn iter(&self) -> impl Iterator<Item = &dyn ComponentPersistence> {
        self.handlers.iter().map(|h| h.as_ref())
    }
}

// ---- little-endian write helpers ----------------------------------

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> PersistenceResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(PersistenceError::UnexpectedEof(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> PersistenceResult<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> PersistenceResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> PersistenceResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> PersistenceResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> PersistenceResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> PersistenceResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

// ---- save ---------------------------------------------------------

fn save_group(group: &InstanceGroup, registry: &PersistenceRegistry, out: &mut Vec<u8>) -> PersistenceResult<()> {
    put_u16(out, group.id());
    let size_pos = out.len();
    put_u32(out, 0); // backpatched below
    let body_start = out.len();

    let destroyed: Vec<u16> = group
        .deltas
        .iter()
        .filter(|d| d.destroyed)
        .map(|d| d.index.raw())
        .collect();
    debug_assert_eq!(destroyed.len(), group.deltas.num_destroyed() as usize);
    put_u16(out, destroyed.len() as u16);
    for slot in destroyed {
        put_u16(out, slot);
    }

    let phases: Vec<_> = group
        .deltas
        .iter()
        .filter(|d| d.has_lifecycle_phase())
        .collect();
    put_u16(out, phases.len() as u16);
    for delta in phases {
        put_u16(out, delta.index.raw());
        out.push(delta.lifecycle_phase);
        put_f32(out, delta.phase_elapsed);
    }

    let handlers: Vec<&dyn ComponentPersistence> =
        registry.iter().filter(|h| h.should_save(group)).collect();
    put_u16(out, handlers.len() as u16);
    for handler in handlers {
        put_u32(out, handler.persistence_id());
        let payload_size_pos = out.len();
        put_u32(out, 0);
        let payload_start = out.len();
        handler.save(group, out)?;
        let payload_size = (out.len() - payload_start) as u32;
        out[payload_size_pos..payload_size_pos + 4].copy_from_slice(&payload_size.to_le_bytes());
    }

    let body_size = (out.len() - body_start) as u32;
    out[size_pos..size_pos + 4].copy_from_slice(&body_size.to_le_bytes());
    Ok(())
}

/// Serializes one manager's divergence from its authored state.
pub fn save_manager(
    manager: &Manager,
    registry: &PersistenceRegistry,
    save_unix_time: u64,
) -> PersistenceResult<Vec<u8>> {
    let mut out = Vec::new();
    put_u32(&mut out, PERSISTENCE_MAGIC);
    put_u32(&mut out, PERSISTENCE_VERSION);
    put_u64(&mut out, save_unix_time);
    put_u32(&mut out, manager.groups().len() as u32);
    for group in manager.groups() {
        save_group(group, registry, &mut out)?;
    }
    debug!(
        "saved manager {:?}: {} groups, {} bytes",
        manager.handle(),
        manager.groups().len(),
        out.len()
    );
    Ok(out)
}

// ---- load ---------------------------------------------------------

fn load_group_body(
    group: &mut InstanceGroup,
    registry: &PersistenceRegistry,
    body: &[u8],
    elapsed_seconds: f64,
) -> PersistenceResult<()> {
    let mut r = Reader::new(body);
    let slot_count = group.num_instances();

    let num_destroyed = r.u16()? as usize;
    if num_destroyed > slot_count {
        return Err(PersistenceError::Corrupted(format!(
            "group {}: {} destroyed slots but only {} slots exist",
            group.id(),
            num_destroyed,
            slot_count
        )));
    }
    for _ in 0..num_destroyed {
        let slot = r.u16()?;
        if (slot as usize) < slot_count {
            group.deltas.set_destroyed(InstanceIndex::new(slot));
        } else {
            warn!("group {}: destroyed slot {} out of range, ignoring", group.id(), slot);
        }
    }

    let num_phases = r.u16()? as usize;
    for _ in 0..num_phases {
        let slot = r.u16()?;
        let phase = r.u8()?;
        let elapsed = r.f32()?;
        if (slot as usize) >= slot_count || phase == LIFECYCLE_PHASE_NONE {
            warn!("group {}: dropping phase delta for slot {}", group.id(), slot);
            continue;
        }
        let elapsed = if elapsed >= 0.0 { Some(elapsed) } else { None };
        group.deltas.set_lifecycle_phase(InstanceIndex::new(slot), phase, elapsed);
    }

    let num_blocks = r.u16()? as usize;
    for _ in 0..num_blocks {
        let id = r.u32()?;
        let size = r.u32()? as usize;
        let payload = r.take(size)?;
        match registry.find(id) {
            Some(handler) => handler.load(group, payload, elapsed_seconds)?,
            None => debug!("group {}: skipping unknown component block {}", group.id(), id),
        }
    }

    group.deltas.add_time_elapsed(elapsed_seconds as f32);
    Ok(())
}

/// Restores saved deltas into `manager`'s groups. Records for groups
/// that no longer exist are skipped; corrupted group records are
/// logged and skipped without failing the rest of the load.
pub fn load_manager(
    manager: &mut Manager,
    registry: &PersistenceRegistry,
    data: &[u8],
    now_unix_time: u64,
) -> PersistenceResult<()> {
    if manager.has_spawned_entities() {
        debug_assert!(false, "persistence load expects a pre-spawn manager");
        log_error!("persistence load into a spawned manager ignored");
        return Ok(());
    }

    let mut r = Reader::new(data);
    let magic = r.u32()?;
    if magic != PERSISTENCE_MAGIC {
        return Err(PersistenceError::BadMagic(magic));
    }
    let version = r.u32()?;
    if version != PERSISTENCE_VERSION {
        return Err(PersistenceError::VersionMismatch {
            found: version,
            expected: PERSISTENCE_VERSION,
        });
    }

    let save_time = r.u64()?;
    let elapsed_seconds = if now_unix_time >= save_time {
        (now_unix_time - save_time) as f64
    } else {
        warn!(
            "save is {}s in the future, clamping elapsed time to zero",
            save_time - now_unix_time
        );
        0.0
    };

    let group_count = r.u32()?;
    for _ in 0..group_count {
        let group_id = r.u16()?;
        let body_size = r.u32()? as usize;
        let body = r.take(body_size)?;

        let Some(group) = manager.find_group_by_id_mut(group_id) else {
            debug!("skipping saved record for removed group {}", group_id);
            continue;
        };
        if let Err(err) = load_group_body(group, registry, body, elapsed_seconds) {
            log_error!("group {} record abandoned: {}", group_id, err);
        }
    }
    Ok(())
}

impl Manager {
    /// See [`save_manager`].
    pub fn save_persistence(
        &self,
        registry: &PersistenceRegistry,
        save_unix_time: u64,
    ) -> PersistenceResult<Vec<u8>> {
        save_manager(self, registry, save_unix_time)
    }

    /// See [`load_manager`].
    pub fn load_persistence(
        &mut self,
        registry: &PersistenceRegistry,
        data: &[u8],
        now_unix_time: u64,
    ) -> PersistenceResult<()> {
        load_manager(self, registry, data, now_unix_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exemplar::{ActorClassId, ExemplarData};
    use crate::math::{Aabb, Transform};
    use crate::render::NullSink;
    use crate::settings::CompiledClassSettings;
    use glam::Vec3;
    use serde::{Deserialize, Serialize};

    fn spawned_manager(count: usize) -> (Manager, u16, crate::entity::EntityStore) {
        let (mut manager, group_id) = manager_with_instances(count);
        manager.on_registered(crate::index::ManagerHandle {
            index: 0,
            generation: 1,
        });
        let volumes = crate::subsystem::GenArena::new();
        let mut entities = crate::entity::EntityStore::new();
        let mut render = NullSink::default();
        manager.initialize_modify_and_spawn_entities(&volumes, &mut entities, &mut render);
        (manager, group_id, entities)
    }

    fn saved_with_destroyed_slot() -> (PersistenceRegistry, Vec<u8>) {
        let (mut source, group_id) = manager_with_instances(2);
        source
            .find_group_by_id_mut(group_id)
            .unwrap()
            .deltas
            .set_destroyed(InstanceIndex::new(0));
        let registry = PersistenceRegistry::new();
        let bytes = source.save_persistence(&registry, 0).unwrap();
        (registry, bytes)
    }

    fn manager_with_instances(count: usize) -> (Manager, u16) {
        let mut manager = Manager::new(Transform::IDENTITY);
        let mut render = NullSink::default();
        let exemplar = ExemplarData {
            class: ActorClassId(1),
            local_bounds: Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(0.5)),
            visualization: vec![],
            custom_data: vec![],
        };
        let group_id = manager.get_or_create_group(
            ActorClassId(1),
            vec![],
            &exemplar,
            CompiledClassSettings::default(),
            &mut render,
        );
        for i in 0..count {
            manager.add_instance(group_id, Transform::from_translation(Vec3::X * i as f32));
        }
        (manager, group_id)
    }

    #[test]
    fn test_round_trip_destroyed_and_phase_deltas() {
        let (mut manager, group_id) = manager_with_instances(4);
        {
            let group = manager.find_group_by_id_mut(group_id).unwrap();
            group.deltas.set_destroyed(InstanceIndex::new(1));
            group.deltas.set_lifecycle_phase(InstanceIndex::new(2), 3, Some(10.0));
        }
        let registry = PersistenceRegistry::new();
        let bytes = manager.save_persistence(&registry, 1_000).unwrap();

        let (mut restored, restored_group) = manager_with_instances(4);
        restored
            .load_persistence(&registry, &bytes, 1_030)
            .unwrap();

        let group = restored.find_group_by_id(restored_group).unwrap();
        assert!(group.deltas.is_destroyed(InstanceIndex::new(1)));
        let phase = group.deltas.get(InstanceIndex::new(2)).unwrap();
        assert_eq!(phase.lifecycle_phase, 3);
        // 10s recorded at save plus 30s of real time since.
        assert!((phase.phase_elapsed - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_clock_skew_clamps_to_zero() {
        let (mut manager, group_id) = manager_with_instances(2);
        manager
            .find_group_by_id_mut(group_id)
            .unwrap()
            .deltas
            .set_lifecycle_phase(InstanceIndex::new(0), 1, Some(5.0));
        let registry = PersistenceRegistry::new();
        let bytes = manager.save_persistence(&registry, 2_000).unwrap();

        let (mut restored, restored_group) = manager_with_instances(2);
        restored.load_persistence(&registry, &bytes, 1_000).unwrap();
        let phase = restored
            .find_group_by_id(restored_group)
            .unwrap()
            .deltas
            .get(InstanceIndex::new(0))
            .unwrap();
        assert_eq!(phase.phase_elapsed, 5.0);
    }

    #[test]
    fn test_bad_magic_and_version_rejected() {
        let (mut manager, _) = manager_with_instances(1);
        let registry = PersistenceRegistry::new();

        let err = manager.load_persistence(&registry, &[0u8; 16], 0).unwrap_err();
        assert!(matches!(err, PersistenceError::BadMagic(_)));

        let mut bytes = manager.save_persistence(&registry, 0).unwrap();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        let err = manager.load_persistence(&registry, &bytes, 0).unwrap_err();
        assert!(matches!(err, PersistenceError::VersionMismatch { found: 99, .. }));
    }

    #[test]
    fn test_unknown_group_records_are_skipped() {
        let (mut big, big_group) = manager_with_instances(3);
        {
            let group = big.find_group_by_id_mut(big_group).unwrap();
            group.deltas.set_destroyed(InstanceIndex::new(0));
        }
        // Add a second group that won't exist on the load side.
        let mut render = NullSink::default();
        let exemplar = ExemplarData {
            class: ActorClassId(2),
            local_bounds: Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE),
            visualization: vec![],
            custom_data: vec![],
        };
        let extra = big.get_or_create_group(
            ActorClassId(2),
            vec![],
            &exemplar,
            CompiledClassSettings::default(),
            &mut render,
        );
        big.add_instance(extra, Transform::from_translation(Vec3::Y));
        big.find_group_by_id_mut(extra)
            .unwrap()
            .deltas
            .set_destroyed(InstanceIndex::new(0));

        let registry = PersistenceRegistry::new();
        let bytes = big.save_persistence(&registry, 0).unwrap();

        let (mut small, small_group) = manager_with_instances(3);
        small.load_persistence(&registry, &bytes, 0).unwrap();
        assert!(small
            .find_group_by_id(small_group)
            .unwrap()
            .deltas
            .is_destroyed(InstanceIndex::new(0)));
    }

    #[test]
    fn test_corrupted_destroyed_count_abandons_group_only() {
        let (mut manager, group_id) = manager_with_instances(2);
        manager
            .find_group_by_id_mut(group_id)
            .unwrap()
            .deltas
            .set_destroyed(InstanceIndex::new(0));
        let registry = PersistenceRegistry::new();
        let mut bytes = manager.save_persistence(&registry, 0).unwrap();

        // Header is 20 bytes, then group id (2) and block size (4); the
        // destroyed count sits right after.
        let count_offset = 20 + 2 + 4;
        bytes[count_offset..count_offset + 2].copy_from_slice(&500u16.to_le_bytes());

        let (mut restored, restored_group) = manager_with_instances(2);
        // Whole-file load still succeeds; the bad group is dropped.
        restored.load_persistence(&registry, &bytes, 0).unwrap();
        assert_eq!(
            restored
                .find_group_by_id(restored_group)
                .unwrap()
                .deltas
                .num_destroyed(),
            0
        );
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_load_into_spawned_manager_panics_in_debug() {
        let (registry, bytes) = saved_with_destroyed_slot();
        let (mut spawned, _, _) = spawned_manager(2);
        let _ = spawned.load_persistence(&registry, &bytes, 0);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_load_into_spawned_manager_is_ignored() {
        let (registry, bytes) = saved_with_destroyed_slot();
        let (mut spawned, group_id, entities) = spawned_manager(2);

        spawned.load_persistence(&registry, &bytes, 0).unwrap();

        // Nothing applied: entities stay alive, no deltas recorded.
        assert!(spawned.find_group_by_id(group_id).unwrap().deltas.is_empty());
        assert_eq!(entities.alive_count(), 2);
    }

    #[derive(Serialize, Deserialize)]
    struct GrowthState {
        stage: u8,
    }

    struct GrowthPersistence;

    impl ComponentPersistence for GrowthPersistence {
        fn persistence_id(&self) -> u32 {
            0xA11CE
        }

        fn save(&self, _group: &InstanceGroup, out: &mut Vec<u8>) -> PersistenceResult<()> {
            let bytes = bincode::serialize(&GrowthState { stage: 4 })?;
            out.extend_from_slice(&bytes);
            Ok(())
        }

        fn load(
            &self,
            group: &mut InstanceGroup,
            payload: &[u8],
            _elapsed_seconds: f64,
        ) -> PersistenceResult<()> {
            let state: GrowthState = bincode::deserialize(payload)?;
            group
                .deltas
                .set_lifecycle_phase(InstanceIndex::new(0), state.stage, None);
            Ok(())
        }
    }

    #[test]
    fn test_component_blocks_round_trip_and_skip_without_handler() {
        let (manager, _) = manager_with_instances(1);
        let mut registry = PersistenceRegistry::new();
        registry.register(Box::new(GrowthPersistence));
        let bytes = manager.save_persistence(&registry, 0).unwrap();

        // With the handler registered, the payload is applied.
        let (mut with_handler, group_id) = manager_with_instances(1);
        with_handler.load_persistence(&registry, &bytes, 0).unwrap();
        assert_eq!(
            with_handler
                .find_group_by_id(group_id)
                .unwrap()
                .deltas
                .get(InstanceIndex::new(0))
                .unwrap()
                .lifecycle_phase,
            4
        );

        // Without it, the block is skipped by its declared size.
        let empty_registry = PersistenceRegistry::new();
        let (mut without_handler, group_id) = manager_with_instances(1);
        without_handler
            .load_persistence(&empty_registry, &bytes, 0)
            .unwrap();
        assert!(without_handler
            .find_group_by_id(group_id)
            .unwrap()
            .deltas
            .is_empty());
    }
}

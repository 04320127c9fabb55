//! LOD-driven lifecycle engine for massive populations of mostly
//! immobile world objects.
//!
//! Instances live as lightweight transform records partitioned into
//! per-cell managers and per-class groups. A subsystem spatially
//! indexes managers and modifier volumes, amortizes bulk LOD
//! re-evaluation through a time-ordered heap, and flips whole groups
//! between detailed and batched representations instead of creating or
//! destroying per-instance objects.
//!
//! ```no_run
//! use instanced_actors::{
//!     ActorClassCatalog, ActorClassDescriptor, ActorClassId, Aabb, InstancedActorsConfig,
//!     NullSink, SettingsRegistry, Subsystem, Transform,
//! };
//! use glam::Vec3;
//!
//! let mut catalog = ActorClassCatalog::new();
//! catalog.register(
//!     ActorClassId(1),
//!     ActorClassDescriptor {
//!         name: "pine_tree".into(),
//!         parent: None,
//!         mesh_bounds: Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(200.0)),
//!         visualization: vec![Default::default()],
//!         custom_data: vec![],
//!     },
//! );
//!
//! let mut world = Subsystem::new(
//!     InstancedActorsConfig::default(),
//!     catalog,
//!     SettingsRegistry::new(),
//!     Box::new(NullSink::default()),
//! );
//! let handle = world.instance_actor(ActorClassId(1), Transform::from_translation(Vec3::X));
//! world.tick(0.0);
//! assert!(handle.is_valid());
//! ```

pub mod entity;
pub mod exemplar;
pub mod index;
pub mod instance;
pub mod iteration;
pub mod lod;
pub mod manager;
pub mod math;
pub mod modifier;
pub mod persistence;
pub mod render;
pub mod settings;
pub mod spatial_index;
pub mod subsystem;

pub use entity::{CommandBuffer, Entity, EntityCommand, EntityStore, RepresentationMode};
pub use exemplar::{
    ActorClassCatalog, ActorClassDescriptor, ActorClassId, ExemplarCache, ExemplarData,
};
pub use index::{
    build_composite_index, extract_instance_data_id, extract_internal_instance_index,
    InstanceHandle, InstanceIndex, ManagerHandle, ModifierVolumeHandle,
};
pub use instance::{DeltaList, InstanceDelta, InstanceGroup, VisualizationInfo};
pub use iteration::{BoundsTestMode, IterationContext};
pub use lod::{BulkLod, BulkLodMask, InstanceCountStats, Viewer, BULK_LOD_TICK_DELAYS};
pub use manager::Manager;
pub use math::{Aabb, QueryVolume, Sphere, Transform};
pub use modifier::{InstanceModifier, ModifierVolume, RemoveInstancesModifier, VolumeShape};
pub use persistence::{
    ComponentPersistence, PersistenceError, PersistenceRegistry, PersistenceResult,
};
pub use render::{
    IsmComponentDescriptor, IsmComponentId, NullSink, RecordingSink, RenderEvent, RenderSink,
};
pub use settings::{ClassSettingsEntry, CompiledClassSettings, SettingsPatch, SettingsRegistry};
pub use spatial_index::HierarchicalHashGrid;
pub use subsystem::Subsystem;

/// Top-level engine configuration. Distances are world units.
#[derive(Debug, Clone, PartialEq)]
pub struct InstancedActorsConfig {
    /// Fallback manager partitioning cell size when a class doesn't
    /// override it.
    pub default_grid_size: f32,
    /// Queue manager entity spawns instead of spawning at registration.
    pub defer_spawn_entities: bool,
    /// Wall-clock budget spent per tick on deferred spawns.
    pub deferred_spawn_budget_seconds: f64,
    /// Master switch for save/load.
    pub persistence_enabled: bool,
    /// True on the simulation authority; remotes never save or load.
    pub authority: bool,
    /// Global scale applied to LOD distance thresholds.
    pub lod_distance_scale: f32,
    pub manager_grid_cell_size: f32,
    pub modifier_volume_grid_cell_size: f32,
}

impl Default for InstancedActorsConfig {
    fn default() -> Self {
        Self {
            default_grid_size: 24_480.0,
            defer_spawn_entities: true,
            deferred_spawn_budget_seconds: 0.002,
            persistence_enabled: true,
            authority: true,
            lod_distance_scale: 1.0,
            manager_grid_cell_size: 25_600.0,
            modifier_volume_grid_cell_size: 25_600.0,
        }
    }
}

//! Per-class settings with layered overrides.
//!
//! Settings come from several places with strict priority: globally
//! enforced settings, then each class in the hierarchy from most
//! derived upward (a class's own overrides before its named base
//! settings, bases in reverse declaration order), then the project
//! default base, then hard defaults. Each field is written at most
//! once, by the highest-priority layer that sets it, and the result is
//! flattened into one plain struct cached per class.

use log::{debug, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::exemplar::{ActorClassCatalog, ActorClassId};

/// Flattened settings applied to every group of one actor class.
/// Distances are world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompiledClassSettings {
    /// Radius inside which instances are always fully detailed.
    pub detailed_representation_lod_distance: f32,
    /// Distance out to which instances keep mid-quality treatment.
    /// Divided by the global LOD distance scale during classification.
    pub max_actor_distance: f32,
    /// Draw distance cutoff. Zero means never cut off.
    pub max_instance_distance: f32,
    /// Whether LOD bucket changes toggle collision on the batched mesh.
    pub control_physics_state: bool,
    pub instances_cast_shadows: bool,
    /// Skip modifier volume attachment entirely for this class.
    pub ignore_modifier_volumes: bool,
    /// Require instances to be fully enclosed by a modifier volume
    /// rather than merely intersecting it.
    pub modifier_volume_enclosed_test: bool,
    /// Manager partitioning cell size for this class.
    pub grid_size: f32,
}

impl Default for CompiledClassSettings {
    fn default() -> Self {
        Self {
            detailed_representation_lod_distance: 5_000.0,
            max_actor_distance: 15_000.0,
            max_instance_distance: 0.0,
            control_physics_state: false,
            instances_cast_shadows: true,
            ignore_modifier_volumes: false,
            modifier_volume_enclosed_test: false,
            grid_size: 24_480.0,
        }
    }
}

/// One settings layer. `None` fields defer to lower-priority layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub detailed_representation_lod_distance: Option<f32>,
    pub max_actor_distance: Option<f32>,
    pub max_instance_distance: Option<f32>,
    pub control_physics_state: Option<bool>,
    pub instances_cast_shadows: Option<bool>,
    pub ignore_modifier_volumes: Option<bool>,
    pub modifier_volume_enclosed_test: Option<bool>,
    pub grid_size: Option<f32>,
}

macro_rules! take_if_unset {
    ($acc:ident, $patch:ident, $($field:ident),+) => {
        $(if $acc.$field.is_none() {
            $acc.$field = $patch.$field;
        })+
    };
}

impl SettingsPatch {
    /// Writes this patch's fields into `acc` where `acc` has not been
    /// written yet. First writer wins, so apply in priority order.
    fn override_if_default(&self, acc: &mut SettingsPatch) {
        let patch = self;
        take_if_unset!(
            acc,
            patch,
            detailed_representation_lod_distance,
            max_actor_distance,
            max_instance_distance,
            control_physics_state,
            instances_cast_shadows,
            ignore_modifier_volumes,
            modifier_volume_enclosed_test,
            grid_size
        );
    }

    fn finalize(&self) -> CompiledClassSettings {
        let defaults = CompiledClassSettings::default();
        CompiledClassSettings {
            detailed_representation_lod_distance: self
                .detailed_representation_lod_distance
                .unwrap_or(defaults.detailed_representation_lod_distance),
            max_actor_distance: self.max_actor_distance.unwrap_or(defaults.max_actor_distance),
            max_instance_distance: self
                .max_instance_distance
                .unwrap_or(defaults.max_instance_distance),
            control_physics_state: self
                .control_physics_state
                .unwrap_or(defaults.control_physics_state),
            instances_cast_shadows: self
                .instances_cast_shadows
                .unwrap_or(defaults.instances_cast_shadows),
            ignore_modifier_volumes: self
                .ignore_modifier_volumes
                .unwrap_or(defaults.ignore_modifier_volumes),
            modifier_volume_enclosed_test: self
                .modifier_volume_enclosed_test
                .unwrap_or(defaults.modifier_volume_enclosed_test),
            grid_size: self.grid_size.unwrap_or(defaults.grid_size),
        }
    }
}

/// Per-class settings entry: the class's own overrides plus named base
/// settings it pulls in (later names take precedence).
#[derive(Debug, Clone, Default)]
pub struct ClassSettingsEntry {
    pub overrides: SettingsPatch,
    pub base_settings: Vec<String>,
}

/// Registry of named and per-class settings layers.
#[derive(Default)]
pub struct SettingsRegistry {
    named: FxHashMap<String, SettingsPatch>,
    per_class: FxHashMap<ActorClassId, ClassSettingsEntry>,
    pub enforced_settings_name: Option<String>,
    pub default_base_settings_name: Option<String>,
}

impl SettingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_named(&mut self, name: impl Into<String>, patch: SettingsPatch) {
        let name = name.into();
        if self.named.insert(name.clone(), patch).is_some() {
            warn!("named settings '{}' re-registered", name);
        }
    }

    pub fn register_class(&mut self, class: ActorClassId, entry: ClassSettingsEntry) {
        self.per_class.insert(class, entry);
    }

    fn apply_named(&self, name: &str, acc: &mut SettingsPatch) {
        match self.named.get(name) {
            Some(patch) => patch.override_if_default(acc),
            None => warn!("named settings '{}' not registered, skipping layer", name),
        }
    }

    /// Flattens the full layer stack for `class`.
    pub fn compile_for_class(
        &self,
        class: ActorClassId,
        catalog: &ActorClassCatalog,
    ) -> CompiledClassSettings {
        let mut acc = SettingsPatch::default();

        if let Some(enforced) = &self.enforced_settings_name {
            self.apply_named(enforced, &mut acc);
        }

        for chain_class in catalog.class_chain(class) {
            if let Some(entry) = self.per_class.get(&chain_class) {
                entry.overrides.override_if_default(&mut acc);
                for base_name in entry.base_settings.iter().rev() {
                    self.apply_named(base_name, &mut acc);
                }
            }
        }

        if let Some(default_base) = &self.default_base_settings_name {
            self.apply_named(default_base, &mut acc);
        }

        let compiled = acc.finalize();
        debug!("compiled settings for class {:?}: {:?}", class, compiled);
        compiled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exemplar::ActorClassDescriptor;
    use crate::math::Aabb;
    use glam::Vec3;

    fn catalog() -> ActorClassCatalog {
        let mut catalog = ActorClassCatalog::new();
        for (id, parent) in [(1, None), (2, Some(ActorClassId(1)))] {
            catalog.register(
                ActorClassId(id),
                ActorClassDescriptor {
                    name: format!("class{}", id),
                    parent,
                    mesh_bounds: Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE),
                    visualization: vec![],
                    custom_data: vec![],
                },
            );
        }
        catalog
    }

    #[test]
    fn test_defaults_when_nothing_registered() {
        let registry = SettingsRegistry::new();
        let compiled = registry.compile_for_class(ActorClassId(1), &catalog());
        assert_eq!(compiled, CompiledClassSettings::default());
    }

    #[test]
    fn test_enforced_beats_class_overrides() {
        let mut registry = SettingsRegistry::new();
        registry.register_named(
            "enforced",
            SettingsPatch {
                max_instance_distance: Some(100.0),
                ..Default::default()
            },
        );
        registry.enforced_settings_name = Some("enforced".into());
        registry.register_class(
            ActorClassId(1),
            ClassSettingsEntry {
                overrides: SettingsPatch {
                    max_instance_distance: Some(999.0),
                    ..Default::default()
                },
                base_settings: vec![],
            },
        );

        let compiled = registry.compile_for_class(ActorClassId(1), &catalog());
        assert_eq!(compiled.max_instance_distance, 100.0);
    }

    #[test]
    fn test_derived_class_beats_parent_and_default_base() {
        let mut registry = SettingsRegistry::new();
        registry.register_class(
            ActorClassId(1),
            ClassSettingsEntry {
                overrides: SettingsPatch {
                    max_actor_distance: Some(50.0),
                    control_physics_state: Some(true),
                    ..Default::default()
                },
                base_settings: vec![],
            },
        );
        registry.register_class(
            ActorClassId(2),
            ClassSettingsEntry {
                overrides: SettingsPatch {
                    max_actor_distance: Some(75.0),
                    ..Default::default()
                },
                base_settings: vec![],
            },
        );
        registry.register_named(
            "project_default",
            SettingsPatch {
                max_actor_distance: Some(10.0),
                grid_size: Some(1_000.0),
                ..Default::default()
            },
        );
        registry.default_base_settings_name = Some("project_default".into());

        let compiled = registry.compile_for_class(ActorClassId(2), &catalog());
        // Own override wins over the parent's.
        assert_eq!(compiled.max_actor_distance, 75.0);
        // Inherited from the parent layer.
        assert!(compiled.control_physics_state);
        // Unset anywhere above the default base.
        assert_eq!(compiled.grid_size, 1_000.0);
    }

    #[test]
    fn test_later_base_settings_take_precedence() {
        let mut registry = SettingsRegistry::new();
        registry.register_named(
            "a",
            SettingsPatch {
                max_instance_distance: Some(1.0),
                ..Default::default()
            },
        );
        registry.register_named(
            "b",
            SettingsPatch {
                max_instance_distance: Some(2.0),
                ..Default::default()
            },
        );
        registry.register_class(
            ActorClassId(1),
            ClassSettingsEntry {
                overrides: SettingsPatch::default(),
                base_settings: vec!["a".into(), "b".into()],
            },
        );

        let compiled = registry.compile_for_class(ActorClassId(1), &catalog());
        assert_eq!(compiled.max_instance_distance, 2.0);
    }
}

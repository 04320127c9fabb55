//! Rendering sink interface.
//!
//! The engine never talks to a renderer directly. Group visualizations
//! push their instanced-mesh components and per-bucket state changes
//! through this trait; the host supplies the real implementation.

use serde::{Deserialize, Serialize};

use crate::math::Transform;

/// Id of one instanced-mesh component owned by the render sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsmComponentId(pub u32);

/// Static description of one instanced-mesh component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsmComponentDescriptor {
    pub mesh: String,
    pub visible_by_default: bool,
    pub physics_enabled_by_default: bool,
    pub cast_shadows: bool,
}

impl Default for IsmComponentDescriptor {
    fn default() -> Self {
        Self {
            mesh: String::new(),
            visible_by_default: true,
            physics_enabled_by_default: true,
            cast_shadows: true,
        }
    }
}

/// Consumer of batched-instance rendering state.
pub trait RenderSink {
    fn create_component(&mut self, descriptor: &IsmComponentDescriptor) -> IsmComponentId;
    fn destroy_component(&mut self, component: IsmComponentId);
    fn add_instances(&mut self, component: IsmComponentId, transforms: &[Transform]);
    fn clear_instances(&mut self, component: IsmComponentId);
    fn set_visibility(&mut self, component: IsmComponentId, visible: bool);
    /// `None` releases the forced level, letting screen-size selection
    /// take over.
    fn set_forced_lod(&mut self, component: IsmComponentId, level: Option<u8>);
    fn set_physics_enabled(&mut self, component: IsmComponentId, enabled: bool);
}

/// Discards everything. Default sink for headless use.
#[derive(Default)]
pub struct NullSink {
    next_id: u32,
}

impl RenderSink for NullSink {
    fn create_component(&mut self, _descriptor: &IsmComponentDescriptor) -> IsmComponentId {
        let id = IsmComponentId(self.next_id);
        self.next_id += 1;
        id
    }

    fn destroy_component(&mut self, _component: IsmComponentId) {}
    fn add_instances(&mut self, _component: IsmComponentId, _transforms: &[Transform]) {}
    fn clear_instances(&mut self, _component: IsmComponentId) {}
    fn set_visibility(&mut self, _component: IsmComponentId, _visible: bool) {}
    fn set_forced_lod(&mut self, _component: IsmComponentId, _level: Option<u8>) {}
    fn set_physics_enabled(&mut self, _component: IsmComponentId, _enabled: bool) {}
}

/// Everything the engine pushed to the sink, in order. Test double.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    CreateComponent {
        component: IsmComponentId,
        mesh: String,
    },
    DestroyComponent {
        component: IsmComponentId,
    },
    AddInstances {
        component: IsmComponentId,
        count: usize,
    },
    ClearInstances {
        component: IsmComponentId,
    },
    SetVisibility {
        component: IsmComponentId,
        visible: bool,
    },
    SetForcedLod {
        component: IsmComponentId,
        level: Option<u8>,
    },
    SetPhysicsEnabled {
        component: IsmComponentId,
        enabled: bool,
    },
}

#[derive(Default)]
pub struct RecordingSink {
    next_id: u32,
    pub events: Vec<RenderEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderSink for RecordingSink {
    fn create_component(&mut self, descriptor: &IsmComponentDescriptor) -> IsmComponentId {
        let component = IsmComponentId(self.next_id);
        self.next_id += 1;
        self.events.push(RenderEvent::CreateComponent {
            component,
            mesh: descriptor.mesh.clone(),
        });
        component
    }

    fn destroy_component(&mut self, component: IsmComponentId) {
        self.events.push(RenderEvent::DestroyComponent { component });
    }

    fn add_instances(&mut self, component: IsmComponentId, transforms: &[Transform]) {
        self.events.push(RenderEvent::AddInstances {
            component,
            count: transforms.len(),
        });
    }

    fn clear_instances(&mut self, component: IsmComponentId) {
        self.events.push(RenderEvent::ClearInstances { component });
    }

    fn set_visibility(&mut self, component: IsmComponentId, visible: bool) {
        self.events.push(RenderEvent::SetVisibility { component, visible });
    }

    fn set_forced_lod(&mut self, component: IsmComponentId, level: Option<u8>) {
        self.events.push(RenderEvent::SetForcedLod { component, level });
    }

    fn set_physics_enabled(&mut self, component: IsmComponentId, enabled: bool) {
        self.events.push(RenderEvent::SetPhysicsEnabled { component, enabled });
    }
}

//! Deferred entity mutations.
//!
//! Iteration passes over instances must not mutate the entity table
//! structurally while borrowing it. Mutations are recorded here and
//! applied in order by `flush` once the pass is over.

use log::trace;

use super::{Entity, EntityStore, RepresentationMode};
use crate::math::Transform;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityCommand {
    SetRepresentationMode {
        entity: Entity,
        mode: RepresentationMode,
    },
    SetTransform {
        entity: Entity,
        transform: Transform,
    },
    Destroy {
        entity: Entity,
    },
}

#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<EntityCommand>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_representation_mode(&mut self, entity: Entity, mode: RepresentationMode) {
        self.commands.push(EntityCommand::SetRepresentationMode { entity, mode });
    }

    pub fn set_transform(&mut self, entity: Entity, transform: Transform) {
        self.commands.push(EntityCommand::SetTransform { entity, transform });
    }

    pub fn destroy(&mut self, entity: Entity) {
        self.commands.push(EntityCommand::Destroy { entity });
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Applies all queued commands in FIFO order. Commands targeting
    /// entities that died earlier in the same flush are silently
    /// skipped.
    pub fn flush(&mut self, store: &mut EntityStore) {
        if self.commands.is_empty() {
            return;
        }
        trace!("flushing {} entity commands", self.commands.len());
        for command in self.commands.drain(..) {
            match command {
                EntityCommand::SetRepresentationMode { entity, mode } => {
                    store.set_representation_mode(entity, mode);
                }
                EntityCommand::SetTransform { entity, transform } => {
                    store.set_transform(entity, transform);
                }
                EntityCommand::Destroy { entity } => {
                    store.destroy(entity);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InstanceHandle;

    #[test]
    fn test_flush_applies_in_order() {
        let mut store = EntityStore::new();
        let mut buffer = CommandBuffer::new();
        let e = store.spawn(InstanceHandle::INVALID, Transform::IDENTITY);

        buffer.set_representation_mode(e, RepresentationMode::Detailed);
        buffer.set_representation_mode(e, RepresentationMode::Batched);
        assert_eq!(buffer.len(), 2);

        buffer.flush(&mut store);
        assert!(buffer.is_empty());
        assert_eq!(store.representation_mode(e), Some(RepresentationMode::Batched));
    }

    #[test]
    fn test_commands_after_destroy_are_skipped() {
        let mut store = EntityStore::new();
        let mut buffer = CommandBuffer::new();
        let e = store.spawn(InstanceHandle::INVALID, Transform::IDENTITY);

        buffer.destroy(e);
        buffer.set_representation_mode(e, RepresentationMode::Detailed);
        buffer.flush(&mut store);

        assert!(!store.is_alive(e));
    }
}

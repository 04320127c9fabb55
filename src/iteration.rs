//! Deferred mutation batching for instance iteration.
//!
//! Iteration passes borrow managers immutably. Removals requested
//! mid-pass are recorded here and applied by `flush_deferred_actions`
//! once the borrow ends. A context dropped while still holding actions
//! is a programming error.

use log::error;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::entity::EntityStore;
use crate::index::{InstanceHandle, InstanceIndex, ManagerHandle};
use crate::manager::Manager;

/// How instance bounds are tested against a query volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsTestMode {
    /// Origin inside the volume, or transformed bounds overlapping it.
    Intersect,
    /// Transformed bounds fully contained by the volume.
    Enclosed,
}

/// Batch of removals collected during an iteration pass.
#[derive(Default)]
pub struct IterationContext {
    instances_to_remove: FxHashMap<(ManagerHandle, u16), Vec<InstanceIndex>>,
    groups_to_clear: FxHashSet<(ManagerHandle, u16)>,
    managers_to_clear: FxHashSet<ManagerHandle>,
}

impl IterationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.instances_to_remove.is_empty()
            && self.groups_to_clear.is_empty()
            && self.managers_to_clear.is_empty()
    }

    pub fn num_pending_removals(&self) -> usize {
        self.instances_to_remove.values().map(Vec::len).sum()
    }

    pub fn remove_instance_deferred(&mut self, handle: InstanceHandle) {
        debug_assert!(handle.is_valid());
        self.instances_to_remove
            .entry((handle.manager, handle.group_id))
            .or_default()
            .push(handle.index);
    }

    pub fn remove_all_instances_deferred(&mut self, manager: ManagerHandle, group_id: u16) {
        self.groups_to_clear.insert((manager, group_id));
    }

    pub fn remove_all_manager_instances_deferred(&mut self, manager: ManagerHandle) {
        self.managers_to_clear.insert(manager);
    }

    /// Applies every pending action targeting `manager`. Actions for
    /// other managers stay queued.
    pub fn flush_deferred_actions(&mut self, manager: &mut Manager, entities: &mut EntityStore) {
        let Some(handle) = manager.handle() else {
            debug_assert!(false, "flushing against an unregistered manager");
            return;
        };

        if self.managers_to_clear.remove(&handle) {
            manager.runtime_remove_all_instances(entities);
            // Finer-grained actions are subsumed.
            self.instances_to_remove.retain(|(m, _), _| *m != handle);
            self.groups_to_clear.retain(|(m, _)| *m != handle);
            return;
        }

        let cleared_groups: Vec<u16> = self
            .groups_to_clear
            .iter()
            .filter(|(m, _)| *m == handle)
            .map(|&(_, g)| g)
            .collect();
        for group_id in cleared_groups {
            self.groups_to_clear.remove(&(handle, group_id));
            self.instances_to_remove.remove(&(handle, group_id));
            manager.runtime_remove_all_group_instances(group_id, entities);
        }

        let keys: Vec<(ManagerHandle, u16)> = self
            .instances_to_remove
            .keys()
            .filter(|(m, _)| *m == handle)
            .copied()
            .collect();
        for key in keys {
            if let Some(indices) = self.instances_to_remove.remove(&key) {
                for index in indices {
                    manager.runtime_remove_instance(key.1, index, entities);
                }
            }
        }
    }
}

impl Drop for IterationContext {
    fn drop(&mut self) {
        if !self.is_empty() {
            error!(
                "iteration context dropped with {} pending removals",
                self.num_pending_removals()
            );
            debug_assert!(
                std::thread::panicking() || self.is_empty(),
                "iteration context dropped without flushing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InstanceIndex;

    #[test]
    fn test_context_accumulates_per_group() {
        let manager = ManagerHandle { index: 0, generation: 1 };
        let mut ctx = IterationContext::new();
        assert!(ctx.is_empty());

        ctx.remove_instance_deferred(InstanceHandle::new(manager, 0, InstanceIndex::new(1)));
        ctx.remove_instance_deferred(InstanceHandle::new(manager, 0, InstanceIndex::new(2)));
        ctx.remove_instance_deferred(InstanceHandle::new(manager, 3, InstanceIndex::new(0)));
        assert_eq!(ctx.num_pending_removals(), 3);

        // Drain manually so the drop check stays quiet.
        ctx.instances_to_remove.clear();
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_unflushed_drop_panics_in_debug() {
        let manager = ManagerHandle { index: 0, generation: 1 };
        let mut ctx = IterationContext::new();
        ctx.remove_instance_deferred(InstanceHandle::new(manager, 0, InstanceIndex::new(0)));
        drop(ctx);
    }
}

//! Sparse per-slot lifecycle overrides.
//!
//! Most instances never diverge from their authored state, so the
//! divergence is stored as a sparse list of deltas rather than columns
//! over every slot. A delta that returns to the fully-default state is
//! removed from the list; counts per delta kind are cached so queries
//! never scan.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::index::InstanceIndex;

/// Sentinel for "no lifecycle phase override".
pub const LIFECYCLE_PHASE_NONE: u8 = 0xFF;

/// Sentinel for "no elapsed-phase time recorded".
pub const PHASE_ELAPSED_NONE: f32 = -1.0;

/// Divergence of one slot from its authored state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceDelta {
    pub index: InstanceIndex,
    pub destroyed: bool,
    pub lifecycle_phase: u8,
    /// Server-side seconds spent in the current phase. Negative means
    /// not recorded.
    pub phase_elapsed: f32,
}

impl InstanceDelta {
    fn new(index: InstanceIndex) -> Self {
        Self {
            index,
            destroyed: false,
            lifecycle_phase: LIFECYCLE_PHASE_NONE,
            phase_elapsed: PHASE_ELAPSED_NONE,
        }
    }

    pub fn has_lifecycle_phase(&self) -> bool {
        self.lifecycle_phase != LIFECYCLE_PHASE_NONE
    }

    pub fn has_phase_elapsed(&self) -> bool {
        self.phase_elapsed >= 0.0
    }

    fn is_default(&self) -> bool {
        !self.destroyed && !self.has_lifecycle_phase() && !self.has_phase_elapsed()
    }
}

/// Sparse delta list with a slot lookup map and cached kind counts.
#[derive(Debug, Default, Clone)]
pub struct DeltaList {
    deltas: Vec<InstanceDelta>,
    by_slot: FxHashMap<u16, usize>,
    num_destroyed: u32,
    num_lifecycle_phase: u32,
    num_phase_elapsed: u32,
}

impl DeltaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn num_destroyed(&self) -> u32 {
        self.num_destroyed
    }

    pub fn num_lifecycle_phase(&self) -> u32 {
        self.num_lifecycle_phase
    }

    pub fn num_phase_elapsed(&self) -> u32 {
        self.num_phase_elapsed
    }

    pub fn get(&self, index: InstanceIndex) -> Option<&InstanceDelta> {
        self.by_slot.get(&index.raw()).map(|&i| &self.deltas[i])
    }

    pub fn is_destroyed(&self, index: InstanceIndex) -> bool {
        self.get(index).map_or(false, |d| d.destroyed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceDelta> {
        self.deltas.iter()
    }

    fn entry_index(&mut self, index: InstanceIndex) -> usize {
        debug_assert!(index.is_valid());
        let slot = index.raw();
        if let Some(&i) = self.by_slot.get(&slot) {
            return i;
        }
        self.deltas.push(InstanceDelta::new(index));
        let i = self.deltas.len() - 1;
        self.by_slot.insert(slot, i);
        i
    }

    /// Drops the entry for `index` if it carries no information,
    /// keeping the lookup map consistent across the swap-remove.
    fn prune_if_default(&mut self, index: InstanceIndex) {
        let slot = index.raw();
        let Some(&i) = self.by_slot.get(&slot) else {
            return;
        };
        if !self.deltas[i].is_default() {
            return;
        }
        self.deltas.swap_remove(i);
        self.by_slot.remove(&slot);
        if i < self.deltas.len() {
            let moved_slot = self.deltas[i].index.raw();
            self.by_slot.insert(moved_slot, i);
        }
    }

    pub fn set_destroyed(&mut self, index: InstanceIndex) {
        let i = self.entry_index(index);
        if !self.deltas[i].destroyed {
            self.deltas[i].destroyed = true;
            self.num_destroyed += 1;
        }
    }

    pub fn clear_destroyed(&mut self, index: InstanceIndex) {
        if let Some(&i) = self.by_slot.get(&index.raw()) {
            if self.deltas[i].destroyed {
                self.deltas[i].destroyed = false;
                self.num_destroyed -= 1;
                self.prune_if_default(index);
            }
        }
    }

    pub fn set_lifecycle_phase(&mut self, index: InstanceIndex, phase: u8, elapsed: Option<f32>) {
        debug_assert!(phase != LIFECYCLE_PHASE_NONE, "use clear_lifecycle_phase to reset");
        let i = self.entry_index(index);
        if !self.deltas[i].has_lifecycle_phase() {
            self.num_lifecycle_phase += 1;
        }
        self.deltas[i].lifecycle_phase = phase;
        match elapsed {
            Some(seconds) => {
                debug_assert!(seconds >= 0.0);
                if !self.deltas[i].has_phase_elapsed() {
                    self.num_phase_elapsed += 1;
                }
                self.deltas[i].phase_elapsed = seconds;
            }
            None => {
                if self.deltas[i].has_phase_elapsed() {
                    self.num_phase_elapsed -= 1;
                }
                self.deltas[i].phase_elapsed = PHASE_ELAPSED_NONE;
            }
        }
    }

    pub fn clear_lifecycle_phase(&mut self, index: InstanceIndex) {
        if let Some(&i) = self.by_slot.get(&index.raw()) {
            let delta = &mut self.deltas[i];
            if delta.has_lifecycle_phase() {
                delta.lifecycle_phase = LIFECYCLE_PHASE_NONE;
                self.num_lifecycle_phase -= 1;
            }
            if delta.has_phase_elapsed() {
                delta.phase_elapsed = PHASE_ELAPSED_NONE;
                self.num_phase_elapsed -= 1;
            }
            self.prune_if_default(index);
        }
    }

    /// Advances every recorded elapsed-phase time by `seconds`.
    /// Used on load to account for real time passed since save.
    pub fn add_time_elapsed(&mut self, seconds: f32) {
        debug_assert!(seconds >= 0.0);
        for delta in &mut self.deltas {
            if delta.has_phase_elapsed() {
                delta.phase_elapsed += seconds;
            }
        }
    }

    /// Rewrites slot indices through `remap` after compaction. Entries
    /// whose slot vanished (returned `None`) are dropped.
    pub fn remap_slots(&mut self, remap: impl Fn(InstanceIndex) -> Option<InstanceIndex>) {
        let old = std::mem::take(&mut self.deltas);
        self.by_slot.clear();
        self.num_destroyed = 0;
        self.num_lifecycle_phase = 0;
        self.num_phase_elapsed = 0;
        for mut delta in old {
            if let Some(new_index) = remap(delta.index) {
                delta.index = new_index;
                if delta.destroyed {
                    self.num_destroyed += 1;
                }
                if delta.has_lifecycle_phase() {
                    self.num_lifecycle_phase += 1;
                }
                if delta.has_phase_elapsed() {
                    self.num_phase_elapsed += 1;
                }
                self.by_slot.insert(new_index.raw(), self.deltas.len());
                self.deltas.push(delta);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(i: u16) -> InstanceIndex {
        InstanceIndex::new(i)
    }

    #[test]
    fn test_destroyed_is_idempotent() {
        let mut deltas = DeltaList::new();
        deltas.set_destroyed(idx(3));
        deltas.set_destroyed(idx(3));
        assert_eq!(deltas.num_destroyed(), 1);
        assert!(deltas.is_destroyed(idx(3)));
        assert!(!deltas.is_destroyed(idx(4)));
    }

    #[test]
    fn test_default_entries_are_pruned() {
        let mut deltas = DeltaList::new();
        deltas.set_destroyed(idx(0));
        deltas.set_destroyed(idx(1));
        deltas.clear_destroyed(idx(0));

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas.num_destroyed(), 1);
        // The swap-removed survivor is still reachable by slot.
        assert!(deltas.is_destroyed(idx(1)));
    }

    #[test]
    fn test_phase_counts_track_elapsed_presence() {
        let mut deltas = DeltaList::new();
        deltas.set_lifecycle_phase(idx(2), 1, None);
        assert_eq!(deltas.num_lifecycle_phase(), 1);
        assert_eq!(deltas.num_phase_elapsed(), 0);

        deltas.set_lifecycle_phase(idx(2), 2, Some(4.5));
        assert_eq!(deltas.num_lifecycle_phase(), 1);
        assert_eq!(deltas.num_phase_elapsed(), 1);

        deltas.clear_lifecycle_phase(idx(2));
        assert!(deltas.is_empty());
        assert_eq!(deltas.num_phase_elapsed(), 0);
    }

    #[test]
    fn test_add_time_elapsed_only_touches_recorded() {
        let mut deltas = DeltaList::new();
        deltas.set_lifecycle_phase(idx(0), 1, Some(2.0));
        deltas.set_lifecycle_phase(idx(1), 1, None);
        deltas.add_time_elapsed(3.0);

        assert_eq!(deltas.get(idx(0)).unwrap().phase_elapsed, 5.0);
        assert!(!deltas.get(idx(1)).unwrap().has_phase_elapsed());
    }

    #[test]
    fn test_remap_drops_vanished_slots() {
        let mut deltas = DeltaList::new();
        deltas.set_destroyed(idx(1));
        deltas.set_lifecycle_phase(idx(5), 2, Some(1.0));

        deltas.remap_slots(|i| if i.raw() == 5 { Some(idx(0)) } else { None });

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas.num_destroyed(), 0);
        assert_eq!(deltas.get(idx(0)).unwrap().lifecycle_phase, 2);
    }
}

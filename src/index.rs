//! Stable instance addressing.
//!
//! Instances are addressed by slot index within their group. Slots are
//! never shifted by removal, so an index stays valid for the lifetime of
//! the group (until an explicit compaction). The composite form packs a
//! group id and a slot into a single `u32` for systems that want one
//! scalar key per instance.

use serde::{Deserialize, Serialize};

/// Slot index within an instance group. `u16::MAX` is the invalid
/// sentinel, which also caps groups at 65535 usable slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceIndex(u16);

impl InstanceIndex {
    pub const NONE: InstanceIndex = InstanceIndex(u16::MAX);

    pub fn new(index: u16) -> Self {
        debug_assert!(index != u16::MAX, "instance index {} is the invalid sentinel", index);
        InstanceIndex(index)
    }

    pub fn from_usize(index: usize) -> Self {
        debug_assert!(index < u16::MAX as usize, "instance index {} exceeds u16 capacity", index);
        InstanceIndex(index as u16)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != u16::MAX
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl Default for InstanceIndex {
    fn default() -> Self {
        Self::NONE
    }
}

impl std::fmt::Display for InstanceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "none")
        }
    }
}

/// Packs a group id and a slot index into one `u32`.
/// Group id occupies the upper 16 bits, the slot the lower 16.
pub fn build_composite_index(group_id: u16, index: InstanceIndex) -> u32 {
    debug_assert!(index.is_valid(), "cannot build a composite index from the invalid sentinel");
    ((group_id as u32) << 16) | index.raw() as u32
}

/// Recovers the group id from a composite index.
pub fn extract_instance_data_id(composite: u32) -> u16 {
    (composite >> 16) as u16
}

/// Recovers the slot index from a composite index.
pub fn extract_internal_instance_index(composite: u32) -> InstanceIndex {
    InstanceIndex((composite & 0xFFFF) as u16)
}

/// Generational slot into the subsystem's manager arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagerHandle {
    pub index: u32,
    pub generation: u32,
}

impl ManagerHandle {
    pub const INVALID: ManagerHandle = ManagerHandle {
        index: u32::MAX,
        generation: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }
}

/// Generational slot into the subsystem's modifier-volume arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModifierVolumeHandle {
    pub index: u32,
    pub generation: u32,
}

impl ModifierVolumeHandle {
    pub const INVALID: ModifierVolumeHandle = ModifierVolumeHandle {
        index: u32::MAX,
        generation: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }
}

/// Full address of a single instance: manager, group, slot.
///
/// A handle is a pure address. It carries no liveness guarantee; the
/// manager validates it on use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    pub manager: ManagerHandle,
    pub group_id: u16,
    pub index: InstanceIndex,
}

impl InstanceHandle {
    pub const INVALID: InstanceHandle = InstanceHandle {
        manager: ManagerHandle::INVALID,
        group_id: 0,
        index: InstanceIndex::NONE,
    };

    pub fn new(manager: ManagerHandle, group_id: u16, index: InstanceIndex) -> Self {
        Self {
            manager,
            group_id,
            index,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.manager.is_valid() && self.index.is_valid()
    }

    pub fn debug_name(&self) -> String {
        if self.manager.is_valid() {
            format!("manager{}/{}[{}]", self.manager.index, self.group_id, self.index)
        } else {
            format!("<none>/{}[{}]", self.group_id, self.index)
        }
    }
}

impl Default for InstanceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_round_trip() {
        for group_id in [0u16, 1, 255, 4096, u16::MAX] {
            for slot in [0u16, 1, 77, u16::MAX - 1] {
                let composite = build_composite_index(group_id, InstanceIndex::new(slot));
                assert_eq!(extract_instance_data_id(composite), group_id);
                assert_eq!(extract_internal_instance_index(composite), InstanceIndex::new(slot));
            }
        }
    }

    #[test]
    fn test_invalid_sentinel() {
        assert!(!InstanceIndex::NONE.is_valid());
        assert!(InstanceIndex::new(0).is_valid());
        assert!(!InstanceHandle::INVALID.is_valid());
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_sentinel_index_rejected() {
        let _ = InstanceIndex::new(u16::MAX);
    }

    #[test]
    fn test_debug_name_format() {
        let handle = InstanceHandle::new(
            ManagerHandle { index: 3, generation: 1 },
            7,
            InstanceIndex::new(42),
        );
        assert_eq!(handle.debug_name(), "manager3/7[42]");
    }
}

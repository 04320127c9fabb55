//! Bulk LOD classification and scheduling primitives.
//!
//! Every instance group carries a single coarse LOD bucket. Buckets are
//! re-evaluated on an amortized schedule: each group owns a record in a
//! time-ordered min-heap, and a tick only pays for the records whose
//! time has come. Re-evaluation delays are long for buckets that rarely
//! change (Detailed, Off) and short where a viewer is likely to push
//! the group across a threshold soon (Medium).

use serde::{Deserialize, Serialize};

use glam::Vec3;

use crate::index::ManagerHandle;
use crate::math::Aabb;
use crate::settings::CompiledClassSettings;

/// Coarse per-group level of detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BulkLod {
    Detailed = 0,
    Medium = 1,
    Low = 2,
    Off = 3,
}

impl BulkLod {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Bitmask over [`BulkLod`] buckets for filtered queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkLodMask(u8);

impl BulkLodMask {
    pub const NONE: BulkLodMask = BulkLodMask(0);
    pub const ALL: BulkLodMask = BulkLodMask(0b1111);

    pub fn from_lod(lod: BulkLod) -> Self {
        BulkLodMask(1 << lod.index())
    }

    pub fn with(self, lod: BulkLod) -> Self {
        BulkLodMask(self.0 | (1 << lod.index()))
    }

    pub fn contains(self, lod: BulkLod) -> bool {
        self.0 & (1 << lod.index()) != 0
    }
}

/// Seconds between re-evaluations, per current bucket.
pub const BULK_LOD_TICK_DELAYS: [f64; BulkLod::COUNT] = [5.0, 1.0, 2.5, 10.0];

/// Forced render LOD level pushed for groups in the Low bucket.
pub const FORCED_LOW_LOD_LEVEL: u8 = 7;

/// An observer position driving LOD selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewer {
    pub location: Vec3,
    pub has_avatar: bool,
}

impl Viewer {
    /// Viewers parked at the origin without an avatar are connection
    /// placeholders and must not pull LOD up around the world origin.
    pub fn is_relevant(&self) -> bool {
        self.has_avatar || self.location.length_squared() > 1.0
    }
}

/// Squared distance from the nearest relevant viewer to `bounds`.
/// Early-exits as soon as a viewer lies within the forced-detailed
/// radius, since no closer viewer can change the answer.
pub fn min_viewer_distance_squared(
    viewers: &[Viewer],
    bounds: &Aabb,
    forced_detailed_distance_squared: f32,
) -> f32 {
    let mut min = f32::MAX;
    for viewer in viewers {
        if !viewer.is_relevant() {
            continue;
        }
        let d = bounds.distance_squared_to_point(viewer.location);
        if d < min {
            min = d;
            if min < forced_detailed_distance_squared {
                break;
            }
        }
    }
    min
}

/// Maps a squared viewer distance to a bucket using the class settings
/// and the global LOD distance scale.
pub fn classify_bulk_lod(
    distance_squared: f32,
    settings: &CompiledClassSettings,
    lod_distance_scale: f32,
) -> BulkLod {
    let forced_detailed = settings.detailed_representation_lod_distance;
    if distance_squared < forced_detailed * forced_detailed {
        return BulkLod::Detailed;
    }

    let scale = if lod_distance_scale > 0.0 { lod_distance_scale } else { 1.0 };
    let medium_distance = settings.max_actor_distance / scale;
    if distance_squared < medium_distance * medium_distance {
        return BulkLod::Medium;
    }

    let max_draw = settings.max_instance_distance;
    if max_draw == 0.0 || distance_squared < max_draw * max_draw {
        return BulkLod::Low;
    }

    BulkLod::Off
}

/// Next re-evaluation time: the bucket delay minus 5%, plus up to 10%
/// random jitter so groups sharing a bucket spread across ticks.
pub fn next_tick_time(now: f64, lod: BulkLod, rand_fraction: f64) -> f64 {
    let delay = BULK_LOD_TICK_DELAYS[lod.index()];
    now + delay * 0.95 + rand_fraction * 0.1 * delay
}

/// Heap record scheduling one group's next re-evaluation. Ordered as a
/// min-heap on time (std's `BinaryHeap` is a max-heap, so the ordering
/// is reversed here).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NextTickEntry {
    pub time: f64,
    pub manager: ManagerHandle,
    pub group_id: u16,
}

impl Eq for NextTickEntry {}

impl Ord for NextTickEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.manager.index.cmp(&self.manager.index))
            .then_with(|| other.group_id.cmp(&self.group_id))
    }
}

impl PartialOrd for NextTickEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Running instance counts per bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstanceCountStats {
    counts: [i64; BulkLod::COUNT],
}

impl InstanceCountStats {
    pub fn apply_change(&mut self, from: BulkLod, to: BulkLod, num_instances: i64) {
        self.counts[from.index()] -= num_instances;
        self.counts[to.index()] += num_instances;
    }

    pub fn add(&mut self, lod: BulkLod, num_instances: i64) {
        self.counts[lod.index()] += num_instances;
    }

    pub fn count(&self, lod: BulkLod) -> i64 {
        self.counts[lod.index()]
    }
}

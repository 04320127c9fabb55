//! Per-group instance data.

mod delta;
mod group;

pub use delta::{DeltaList, InstanceDelta, LIFECYCLE_PHASE_NONE, PHASE_ELAPSED_NONE};
pub use group::{InstanceGroup, VisualizationInfo};

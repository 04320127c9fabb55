//! Spatial indexing for managers and modifier volumes.
//!
//! The subsystem keeps two independent grids with separately tuned base
//! cell sizes. Queries return a coarse candidate superset; callers
//! re-test exact bounds.

mod hierarchical_grid;

pub use hierarchical_grid::{HierarchicalHashGrid, GRID_LEVELS, LEVEL_CELL_RATIO};

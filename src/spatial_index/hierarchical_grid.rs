//! Multi-level uniform hash grid.
//!
//! Each entry is stored at exactly one level, chosen as the finest level
//! whose cell size fits the entry's bounds, and inserted into every cell
//! the bounds overlap at that level. Queries walk all levels over the
//! overlapping cell range and deduplicate.

use std::hash::Hash;

use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::math::Aabb;

/// Number of grid levels.
pub const GRID_LEVELS: usize = 3;

/// Cell size multiplier between adjacent levels.
pub const LEVEL_CELL_RATIO: f32 = 4.0;

type CellCoord = (i32, i32, i32);

struct GridLevel<H> {
    cell_size: f32,
    cells: FxHashMap<CellCoord, Vec<H>>,
}

impl<H> GridLevel<H> {
    fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            cells: FxHashMap::default(),
        }
    }

    fn cell_range(&self, bounds: &Aabb) -> (CellCoord, CellCoord) {
        let min = (
            (bounds.min.x / self.cell_size).floor() as i32,
            (bounds.min.y / self.cell_size).floor() as i32,
            (bounds.min.z / self.cell_size).floor() as i32,
        );
        let max = (
            (bounds.max.x / self.cell_size).floor() as i32,
            (bounds.max.y / self.cell_size).floor() as i32,
            (bounds.max.z / self.cell_size).floor() as i32,
        );
        (min, max)
    }
}

/// Hash grid over axis-aligned bounds, generic over the stored handle.
pub struct HierarchicalHashGrid<H> {
    levels: Vec<GridLevel<H>>,
    entry_count: usize,
}

impl<H: Copy + Eq + Hash> HierarchicalHashGrid<H> {
    pub fn new(base_cell_size: f32) -> Self {
        debug_assert!(base_cell_size > 0.0, "grid cell size must be positive");
        let mut levels = Vec::with_capacity(GRID_LEVELS);
        let mut cell_size = base_cell_size;
        for _ in 0..GRID_LEVELS {
            levels.push(GridLevel::new(cell_size));
            cell_size *= LEVEL_CELL_RATIO;
        }
        Self {
            levels,
            entry_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Finest level whose cell size covers the largest extent of
    /// `bounds`. Oversized bounds land on the coarsest level.
    fn level_for(&self, bounds: &Aabb) -> usize {
        let extent = bounds.max - bounds.min;
        let largest = extent.x.max(extent.y).max(extent.z);
        for (i, level) in self.levels.iter().enumerate() {
            if largest <= level.cell_size {
                return i;
            }
        }
        GRID_LEVELS - 1
    }

    pub fn add(&mut self, handle: H, bounds: &Aabb) {
        debug_assert!(bounds.is_valid(), "cannot index an inverted bounding box");
        let level_index = self.level_for(bounds);
        let level = &mut self.levels[level_index];
        let (min, max) = level.cell_range(bounds);
        for x in min.0..=max.0 {
            for y in min.1..=max.1 {
                for z in min.2..=max.2 {
                    level.cells.entry((x, y, z)).or_default().push(handle);
                }
            }
        }
        self.entry_count += 1;
        trace!(
            "grid add: level {} cells [{:?}..{:?}]",
            level_index, min, max
        );
    }

    /// Removes an entry previously added with the same bounds. Returns
    /// false when no cell held the handle.
    pub fn remove(&mut self, handle: H, bounds: &Aabb) -> bool {
        let level_index = self.level_for(bounds);
        let level = &mut self.levels[level_index];
        let (min, max) = level.cell_range(bounds);
        let mut removed_any = false;
        for x in min.0..=max.0 {
            for y in min.1..=max.1 {
                for z in min.2..=max.2 {
                    if let Some(cell) = level.cells.get_mut(&(x, y, z)) {
                        if let Some(pos) = cell.iter().position(|&h| h == handle) {
                            cell.swap_remove(pos);
                            removed_any = true;
                        }
                        if cell.is_empty() {
                            level.cells.remove(&(x, y, z));
                        }
                    }
                }
            }
        }
        if removed_any {
            self.entry_count -= 1;
        }
        removed_any
    }

    /// Collects every handle whose cells overlap `bounds`. Candidate
    /// superset only; the per-cell test is conservative.
    pub fn query(&self, bounds: &Aabb, out: &mut Vec<H>) {
        let mut seen: FxHashSet<H> = FxHashSet::default();
        for level in &self.levels {
            if level.cells.is_empty() {
                continue;
            }
            let (min, max) = level.cell_range(bounds);
            for x in min.0..=max.0 {
                for y in min.1..=max.1 {
                    for z in min.2..=max.2 {
                        if let Some(cell) = level.cells.get(&(x, y, z)) {
                            for &handle in cell {
                                if seen.insert(handle) {
                                    out.push(handle);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn query_vec(&self, bounds: &Aabb) -> Vec<H> {
        let mut out = Vec::new();
        self.query(bounds, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn unit_box(center: Vec3) -> Aabb {
        Aabb::from_center_half_extents(center, Vec3::splat(0.5))
    }

    #[test]
    fn test_add_query_remove_round_trip() {
        let mut grid: HierarchicalHashGrid<u32> = HierarchicalHashGrid::new(10.0);
        let bounds = unit_box(Vec3::new(5.0, 5.0, 5.0));
        grid.add(1, &bounds);
        assert_eq!(grid.len(), 1);

        let hits = grid.query_vec(&Aabb::new(Vec3::ZERO, Vec3::splat(10.0)));
        assert_eq!(hits, vec![1]);

        assert!(grid.remove(1, &bounds));
        assert!(grid.is_empty());
        assert!(grid.query_vec(&Aabb::new(Vec3::ZERO, Vec3::splat(10.0))).is_empty());
        assert!(!grid.remove(1, &bounds));
    }

    #[test]
    fn test_large_bounds_use_coarser_level() {
        let mut grid: HierarchicalHashGrid<u32> = HierarchicalHashGrid::new(10.0);
        // Fits a level-1 cell (40.0) but not a base cell.
        let big = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(15.0));
        assert_eq!(grid.level_for(&big), 1);
        grid.add(7, &big);

        // A small query far inside the big entry's footprint still finds it.
        let probe = unit_box(Vec3::new(12.0, -12.0, 3.0));
        assert_eq!(grid.query_vec(&probe), vec![7]);
    }

    #[test]
    fn test_query_deduplicates_multi_cell_entries() {
        let mut grid: HierarchicalHashGrid<u32> = HierarchicalHashGrid::new(10.0);
        // Straddles multiple base cells.
        let straddling = Aabb::new(Vec3::new(-4.0, -4.0, -4.0), Vec3::new(4.0, 4.0, 4.0));
        grid.add(3, &straddling);

        let hits = grid.query_vec(&Aabb::new(Vec3::splat(-20.0), Vec3::splat(20.0)));
        assert_eq!(hits, vec![3]);
    }

    #[test]
    fn test_disjoint_entries_not_returned() {
        let mut grid: HierarchicalHashGrid<u32> = HierarchicalHashGrid::new(10.0);
        grid.add(1, &unit_box(Vec3::new(5.0, 5.0, 5.0)));
        grid.add(2, &unit_box(Vec3::new(105.0, 5.0, 5.0)));

        let hits = grid.query_vec(&unit_box(Vec3::new(5.0, 5.0, 5.0)));
        assert_eq!(hits, vec![1]);
    }
}

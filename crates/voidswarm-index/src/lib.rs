//! Uniform-grid spatial indexing for swarm neighborhood queries.
//!
//! World space is partitioned into cubes of `cell_size` world units. A
//! position maps to a [`CellCoord`] by floor division, so every position has
//! exactly one home cell and two positions closer than `cell_size` are always
//! within one cell of each other along every axis.

use glam::Vec3;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted by the spatial index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Integer coordinate of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellCoord {
    /// Construct a cell coordinate from its components.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The cell displaced from this one by `(dx, dy, dz)`.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }
}

/// The 26 offsets surrounding a cell, in fixed scan order.
///
/// The order is part of the contract: fallback scans visit these offsets
/// deterministically and stop at the first populated bucket.
pub const NEIGHBOR_OFFSETS: [(i32, i32, i32); 26] = [
    (-1, -1, -1),
    (-1, -1, 0),
    (-1, -1, 1),
    (-1, 0, -1),
    (-1, 0, 0),
    (-1, 0, 1),
    (-1, 1, -1),
    (-1, 1, 0),
    (-1, 1, 1),
    (0, -1, -1),
    (0, -1, 0),
    (0, -1, 1),
    (0, 0, -1),
    (0, 0, 1),
    (0, 1, -1),
    (0, 1, 0),
    (0, 1, 1),
    (1, -1, -1),
    (1, -1, 0),
    (1, -1, 1),
    (1, 0, -1),
    (1, 0, 0),
    (1, 0, 1),
    (1, 1, -1),
    (1, 1, 0),
    (1, 1, 1),
];

/// Map a world position to its cell via floor division.
///
/// Floor (not truncation toward zero) is used uniformly, so cell boundaries
/// are symmetric around the origin and negative coordinates bucket correctly.
#[inline]
#[must_use]
pub fn cell_of(pos: Vec3, cell_size: f32) -> CellCoord {
    CellCoord::new(
        (pos.x / cell_size).floor() as i32,
        (pos.y / cell_size).floor() as i32,
        (pos.z / cell_size).floor() as i32,
    )
}

/// Sparse uniform grid mapping cells to buckets of copyable handles.
///
/// The grid never rejects a lookup: absent cells read as empty buckets.
/// Membership goes stale as items move; callers re-run [`SpatialGrid::rebuild`]
/// periodically rather than every tick, trading exactness for throughput.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialGrid<T> {
    cell_size: f32,
    cells: HashMap<CellCoord, Vec<T>>,
}

impl<T: Copy> SpatialGrid<T> {
    /// Create an empty grid with the provided cell size.
    pub fn new(cell_size: f32) -> Result<Self, IndexError> {
        if !(cell_size > 0.0) {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        Ok(Self {
            cell_size,
            cells: HashMap::new(),
        })
    }

    /// Edge length of one cell in world units.
    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Home cell of `pos` under this grid's cell size.
    #[inline]
    #[must_use]
    pub fn cell_of(&self, pos: Vec3) -> CellCoord {
        cell_of(pos, self.cell_size)
    }

    /// Append `item` to the bucket for `cell`. No uniqueness constraint.
    pub fn insert(&mut self, cell: CellCoord, item: T) {
        self.cells.entry(cell).or_default().push(item);
    }

    /// Append `item` to the bucket for the cell containing `pos`.
    pub fn insert_at(&mut self, pos: Vec3, item: T) {
        let cell = self.cell_of(pos);
        self.insert(cell, item);
    }

    /// The bucket for `cell`; absent cells yield an empty slice, never an error.
    #[must_use]
    pub fn bucket(&self, cell: CellCoord) -> &[T] {
        self.cells.get(&cell).map_or(&[], Vec::as_slice)
    }

    /// Iterate the home bucket plus all 26 adjacent buckets.
    pub fn neighborhood(&self, cell: CellCoord) -> impl Iterator<Item = &T> + '_ {
        std::iter::once(cell)
            .chain(
                NEIGHBOR_OFFSETS
                    .iter()
                    .map(move |&(dx, dy, dz)| cell.offset(dx, dy, dz)),
            )
            .flat_map(move |c| self.bucket(c).iter())
    }

    /// The home bucket, or the first populated adjacent bucket when the home
    /// cell is empty. Scans [`NEIGHBOR_OFFSETS`] in order and stops at the
    /// first non-empty bucket; an isolated cell yields an empty slice.
    #[must_use]
    pub fn fallback_bucket(&self, cell: CellCoord) -> &[T] {
        let home = self.bucket(cell);
        if !home.is_empty() {
            return home;
        }
        for &(dx, dy, dz) in &NEIGHBOR_OFFSETS {
            let bucket = self.bucket(cell.offset(dx, dy, dz));
            if !bucket.is_empty() {
                return bucket;
            }
        }
        &[]
    }

    /// Nearest item within the 27-cell neighborhood of `pos`, with its
    /// distance. `position_of` may decline an item (stale handle) by
    /// returning `None`.
    pub fn nearest_in_neighborhood(
        &self,
        pos: Vec3,
        mut position_of: impl FnMut(&T) -> Option<Vec3>,
    ) -> Option<(T, OrderedFloat<f32>)> {
        let cell = self.cell_of(pos);
        let mut best: Option<(T, OrderedFloat<f32>)> = None;
        for item in self.neighborhood(cell) {
            let Some(item_pos) = position_of(item) else {
                continue;
            };
            let dist = OrderedFloat(item_pos.distance(pos));
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((*item, dist));
            }
        }
        best
    }

    /// Rebuild the whole mapping from current positions. O(N) in items.
    pub fn rebuild<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = (Vec3, T)>,
    {
        self.cells.clear();
        for (pos, item) in items {
            self.insert_at(pos, item);
        }
    }

    /// Iterate populated cells and their buckets.
    pub fn iter_cells(&self) -> impl Iterator<Item = (CellCoord, &[T])> + '_ {
        self.cells.iter().map(|(&cell, bucket)| (cell, bucket.as_slice()))
    }

    /// Total number of stored items across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    /// Returns true when no items are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.values().all(Vec::is_empty)
    }

    /// Number of populated cells.
    #[must_use]
    pub fn populated_cells(&self) -> usize {
        self.cells.len()
    }

    /// Drop all buckets.
    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> SpatialGrid<usize> {
        SpatialGrid::new(3.0).expect("grid")
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        assert!(matches!(
            SpatialGrid::<usize>::new(0.0),
            Err(IndexError::InvalidConfig(_))
        ));
        assert!(matches!(
            SpatialGrid::<usize>::new(-1.0),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cell_of_is_deterministic() {
        let pos = Vec3::new(7.3, -2.1, 0.4);
        assert_eq!(cell_of(pos, 3.0), cell_of(pos, 3.0));
    }

    #[test]
    fn cell_boundary_splits_along_axis() {
        let a = cell_of(Vec3::new(2.999, 0.0, 0.0), 3.0);
        let b = cell_of(Vec3::new(3.001, 0.0, 0.0), 3.0);
        assert_ne!(a.x, b.x);
        assert_eq!(a, CellCoord::new(0, 0, 0));
        assert_eq!(b, CellCoord::new(1, 0, 0));
    }

    #[test]
    fn negative_positions_floor_below_origin() {
        assert_eq!(cell_of(Vec3::new(-0.1, -0.1, -0.1), 3.0), CellCoord::new(-1, -1, -1));
        assert_eq!(cell_of(Vec3::new(-3.1, 0.0, 0.0), 3.0).x, -2);
    }

    #[test]
    fn absent_cells_read_empty() {
        let g = grid();
        assert!(g.bucket(CellCoord::new(5, 5, 5)).is_empty());
        assert_eq!(g.neighborhood(CellCoord::new(5, 5, 5)).count(), 0);
        assert!(g.fallback_bucket(CellCoord::new(5, 5, 5)).is_empty());
    }

    #[test]
    fn neighborhood_reaches_adjacent_items() {
        // Two positions closer than cell_size but straddling a boundary must
        // be mutually reachable through the 26-neighborhood.
        let mut g = grid();
        let a = Vec3::new(2.9, 0.0, 0.0);
        let b = Vec3::new(3.1, 0.0, 0.0);
        g.insert_at(a, 0);
        g.insert_at(b, 1);
        assert_ne!(g.cell_of(a), g.cell_of(b));
        let near_a: Vec<usize> = g.neighborhood(g.cell_of(a)).copied().collect();
        assert!(near_a.contains(&0) && near_a.contains(&1));
        let near_b: Vec<usize> = g.neighborhood(g.cell_of(b)).copied().collect();
        assert!(near_b.contains(&0) && near_b.contains(&1));
    }

    #[test]
    fn fallback_prefers_home_bucket() {
        let mut g = grid();
        let home = CellCoord::new(0, 0, 0);
        g.insert(home, 7);
        g.insert(home.offset(1, 0, 0), 8);
        assert_eq!(g.fallback_bucket(home), &[7]);
    }

    #[test]
    fn fallback_scans_neighbors_when_home_is_empty() {
        let mut g = grid();
        let home = CellCoord::new(0, 0, 0);
        g.insert(home.offset(1, 0, 0), 9);
        assert_eq!(g.fallback_bucket(home), &[9]);
    }

    #[test]
    fn rebuild_is_idempotent_for_static_items() {
        let mut g = grid();
        let items = [(Vec3::new(1.0, 1.0, 1.0), 0), (Vec3::new(-4.0, 0.5, 9.0), 1)];
        g.rebuild(items);
        let before: Vec<(CellCoord, Vec<usize>)> = g
            .iter_cells()
            .map(|(c, b)| (c, b.to_vec()))
            .collect();
        g.rebuild(items);
        let mut after: Vec<(CellCoord, Vec<usize>)> = g
            .iter_cells()
            .map(|(c, b)| (c, b.to_vec()))
            .collect();
        let mut before = before;
        before.sort_by_key(|(c, _)| (c.x, c.y, c.z));
        after.sort_by_key(|(c, _)| (c.x, c.y, c.z));
        assert_eq!(before, after);
    }

    #[test]
    fn rebuild_drops_stale_buckets() {
        let mut g = grid();
        g.insert_at(Vec3::new(10.0, 10.0, 10.0), 3);
        g.rebuild([(Vec3::ZERO, 3usize)]);
        assert!(g.bucket(g.cell_of(Vec3::new(10.0, 10.0, 10.0))).is_empty());
        assert_eq!(g.bucket(g.cell_of(Vec3::ZERO)), &[3]);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn nearest_skips_declined_items_and_orders_by_distance() {
        let mut g = grid();
        g.insert_at(Vec3::new(1.0, 0.0, 0.0), 0);
        g.insert_at(Vec3::new(2.0, 0.0, 0.0), 1);
        g.insert_at(Vec3::new(0.5, 0.0, 0.0), 2);
        let positions = [
            Some(Vec3::new(1.0, 0.0, 0.0)),
            Some(Vec3::new(2.0, 0.0, 0.0)),
            None, // stale handle
        ];
        let best = g
            .nearest_in_neighborhood(Vec3::ZERO, |&i| positions[i])
            .expect("nearest");
        assert_eq!(best.0, 0);
        assert!((best.1.into_inner() - 1.0).abs() < 1e-6);
    }
}

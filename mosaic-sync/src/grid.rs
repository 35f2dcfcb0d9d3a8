//! Authoritative grid state.
//!
//! The grid has fixed dimensions, so it is stored densely: one slot per
//! coordinate, each behind its own lock. Operations on distinct coordinates
//! never contend; operations on the same coordinate are serialized by the
//! slot lock.
//!
//! ```text
//!  (0,0) (1,0) (2,0) ... (w-1,0)      slot index = y * width + x
//!  (0,1) (1,1) ...
//!   ...
//! ```
//!
//! `snapshot()` and `clear()` visit the slots one at a time. Their
//! consistency with the event stream comes from [`SyncEngine`], which runs
//! every mutation and every snapshot inside its commit section.
//!
//! [`SyncEngine`]: crate::engine::SyncEngine

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cell::{Cell, Color};
use crate::error::SyncError;

/// Fixed grid size in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDimensions {
    pub width: u32,
    pub height: u32,
}

impl GridDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Reject out-of-bounds coordinates.
    pub fn check(&self, x: u32, y: u32) -> Result<(), SyncError> {
        if self.contains(x, y) {
            Ok(())
        } else {
            Err(SyncError::InvalidCoordinate {
                x,
                y,
                width: self.width,
                height: self.height,
            })
        }
    }
}

/// Result of [`GridStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The coordinate was empty; the cell has a fresh id.
    Inserted(Cell),
    /// The coordinate was occupied; id kept, color replaced.
    Updated(Cell),
}

impl Placement {
    pub fn cell(&self) -> Cell {
        match self {
            Placement::Inserted(cell) | Placement::Updated(cell) => *cell,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Placement::Inserted(_))
    }
}

/// Dense, per-coordinate-locked cell storage.
pub struct GridStore {
    dimensions: GridDimensions,
    slots: Vec<Mutex<Option<Cell>>>,
    /// Occupied slot count, kept alongside the slots for O(1) `len()`.
    occupied: AtomicUsize,
}

impl GridStore {
    pub fn new(dimensions: GridDimensions) -> Self {
        let slots = (0..dimensions.area()).map(|_| Mutex::new(None)).collect();
        Self {
            dimensions,
            slots,
            occupied: AtomicUsize::new(0),
        }
    }

    pub fn dimensions(&self) -> GridDimensions {
        self.dimensions
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.dimensions.contains(x, y)
    }

    fn slot(&self, x: u32, y: u32) -> Result<&Mutex<Option<Cell>>, SyncError> {
        self.dimensions.check(x, y)?;
        let index = y as usize * self.dimensions.width as usize + x as usize;
        Ok(&self.slots[index])
    }

    /// Current occupant of `(x, y)`. Out-of-bounds reads return `None`.
    pub fn get(&self, x: u32, y: u32) -> Option<Cell> {
        self.slot(x, y).ok().and_then(|slot| *slot.lock())
    }

    /// Create or recolor the cell at `(x, y)`.
    pub fn put(&self, x: u32, y: u32, color: Color) -> Result<Placement, SyncError> {
        let mut slot = self.slot(x, y)?.lock();
        match slot.as_mut() {
            Some(cell) => {
                cell.color = color;
                Ok(Placement::Updated(*cell))
            }
            None => {
                let cell = Cell::new(x, y, color);
                *slot = Some(cell);
                self.occupied.fetch_add(1, Ordering::Relaxed);
                Ok(Placement::Inserted(cell))
            }
        }
    }

    /// Remove the cell at `(x, y)`, returning it if one was there.
    pub fn delete(&self, x: u32, y: u32) -> Result<Option<Cell>, SyncError> {
        let removed = self.slot(x, y)?.lock().take();
        if removed.is_some() {
            self.occupied.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Remove every cell. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for slot in &self.slots {
            if slot.lock().take().is_some() {
                removed += 1;
            }
        }
        self.occupied.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    /// All live cells in row-major order.
    pub fn snapshot(&self) -> Vec<Cell> {
        let mut cells = Vec::with_capacity(self.len());
        for slot in &self.slots {
            if let Some(cell) = *slot.lock() {
                cells.push(cell);
            }
        }
        cells
    }

    /// Rehydrate from persisted cells, keeping their ids.
    ///
    /// Out-of-bounds cells are skipped. Returns how many cells were loaded.
    pub fn load(&self, cells: impl IntoIterator<Item = Cell>) -> usize {
        let mut loaded = 0;
        for cell in cells {
            let slot = match self.slot(cell.x, cell.y) {
                Ok(slot) => slot,
                Err(e) => {
                    log::warn!("Skipping persisted cell {}: {e}", cell.id);
                    continue;
                }
            };
            let previous = slot.lock().replace(cell);
            if previous.is_none() {
                self.occupied.fetch_add(1, Ordering::Relaxed);
            }
            loaded += 1;
        }
        loaded
    }

    pub fn len(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn grid_4x4() -> GridStore {
        GridStore::new(GridDimensions::new(4, 4))
    }

    #[test]
    fn test_put_then_get() {
        let grid = grid_4x4();
        let placed = grid.put(1, 2, Color::rgb(255, 0, 0)).unwrap();
        assert!(placed.is_insert());

        let cell = grid.get(1, 2).unwrap();
        assert_eq!(cell, placed.cell());
        assert_eq!(cell.color, Color::rgb(255, 0, 0));
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn test_update_keeps_id() {
        let grid = grid_4x4();
        let first = grid.put(0, 0, Color::BLACK).unwrap().cell();
        let second = grid.put(0, 0, Color::WHITE).unwrap();

        assert!(!second.is_insert());
        assert_eq!(second.cell().id, first.id);
        assert_eq!(grid.get(0, 0).unwrap().color, Color::WHITE);
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn test_delete_then_recreate_gets_new_id() {
        let grid = grid_4x4();
        let first = grid.put(3, 3, Color::BLACK).unwrap().cell();

        let removed = grid.delete(3, 3).unwrap();
        assert_eq!(removed.map(|c| c.id), Some(first.id));
        assert!(grid.get(3, 3).is_none());
        assert!(grid.is_empty());

        let again = grid.put(3, 3, Color::BLACK).unwrap();
        assert!(again.is_insert());
        assert_ne!(again.cell().id, first.id);
    }

    #[test]
    fn test_delete_empty_coordinate() {
        let grid = grid_4x4();
        assert_eq!(grid.delete(2, 2).unwrap(), None);
        assert_eq!(grid.len(), 0);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let grid = grid_4x4();
        assert!(matches!(
            grid.put(4, 0, Color::BLACK),
            Err(SyncError::InvalidCoordinate { x: 4, y: 0, width: 4, height: 4 })
        ));
        assert!(grid.delete(0, 4).is_err());
        assert!(grid.get(10, 10).is_none());
    }

    #[test]
    fn test_clear() {
        let grid = grid_4x4();
        for i in 0..4 {
            grid.put(i, i, Color::BLACK).unwrap();
        }
        assert_eq!(grid.clear(), 4);
        assert!(grid.is_empty());
        assert!(grid.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_row_major() {
        let grid = grid_4x4();
        grid.put(3, 0, Color::BLACK).unwrap();
        grid.put(0, 1, Color::BLACK).unwrap();
        grid.put(1, 0, Color::BLACK).unwrap();

        let coords: Vec<_> = grid.snapshot().iter().map(Cell::coord).collect();
        assert_eq!(coords, vec![(1, 0), (3, 0), (0, 1)]);
    }

    #[test]
    fn test_load_keeps_ids_and_skips_out_of_bounds() {
        let grid = grid_4x4();
        let inside = Cell::new(2, 2, Color::WHITE);
        let outside = Cell::new(9, 9, Color::WHITE);

        assert_eq!(grid.load([inside, outside]), 1);
        assert_eq!(grid.get(2, 2), Some(inside));
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn test_concurrent_distinct_coordinates() {
        let grid = Arc::new(GridStore::new(GridDimensions::new(16, 16)));
        let handles: Vec<_> = (0..16)
            .map(|y| {
                let grid = grid.clone();
                std::thread::spawn(move || {
                    for x in 0..16 {
                        grid.put(x, y, Color::from_u32(x * 16 + y)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(grid.len(), 256);
        assert_eq!(grid.get(5, 7).unwrap().color, Color::from_u32(5 * 16 + 7));
    }
}

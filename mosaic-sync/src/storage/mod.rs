//! Persistence collaborator for the grid.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  MutationEvent   ┌──────────────────┐   PixelStore   ┌─────────────┐
//! │ SyncEngine  │ ───────────────► │ PersistenceWorker│ ─────────────► │ RocksStore  │
//! │ (in-memory) │  (commit order)  │ (blocking task)  │                │ MemoryStore │
//! └──────┬──────┘                  └──────────────────┘                └──────┬──────┘
//!        │                                                                    │
//!        └───────────────────── load_all() on startup ◄───────────────────────┘
//! ```
//!
//! The in-memory grid is authoritative. Store failures are logged and
//! counted but never fail or delay a commit; the engine's reconciliation
//! pass repairs the store afterwards.

pub mod rocks;
pub mod worker;

pub use rocks::{RocksStore, StoreConfig};
pub use worker::PersistenceWorker;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cell::Cell;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    /// Serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Deserialization failed
    #[error("deserialization error: {0}")]
    Deserialization(String),
    /// The store was created for a different grid size
    #[error("store holds a {stored_width}x{stored_height} grid, expected {width}x{height}")]
    DimensionMismatch {
        stored_width: u32,
        stored_height: u32,
        width: u32,
        height: u32,
    },
    /// The store is refusing writes
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable storage for cells.
///
/// Called from the persistence worker, never from inside a lock.
pub trait PixelStore: Send + Sync {
    /// Insert or overwrite the cell at its coordinate.
    fn persist(&self, cell: &Cell) -> Result<(), StoreError>;

    /// Remove whatever is stored at `(x, y)`.
    fn delete_persisted(&self, x: u32, y: u32) -> Result<(), StoreError>;

    /// Remove every stored cell.
    fn clear_all_persisted(&self) -> Result<(), StoreError>;

    /// Every stored cell, used to rehydrate the grid on restart.
    fn load_all(&self) -> Result<Vec<Cell>, StoreError>;
}

/// In-memory store for tests and ephemeral deployments.
///
/// `set_failing(true)` makes every write fail, for exercising the
/// persistence-failure path.
#[derive(Default)]
pub struct MemoryStore {
    cells: Mutex<BTreeMap<(u32, u32), Cell>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Cell> {
        self.cells.lock().get(&(y, x)).copied()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Acquire) {
            Err(StoreError::Unavailable("memory store set to fail".into()))
        } else {
            Ok(())
        }
    }
}

impl PixelStore for MemoryStore {
    fn persist(&self, cell: &Cell) -> Result<(), StoreError> {
        self.check_available()?;
        // Keyed (y, x) so iteration is row-major like the grid
        self.cells.lock().insert((cell.y, cell.x), *cell);
        Ok(())
    }

    fn delete_persisted(&self, x: u32, y: u32) -> Result<(), StoreError> {
        self.check_available()?;
        self.cells.lock().remove(&(y, x));
        Ok(())
    }

    fn clear_all_persisted(&self) -> Result<(), StoreError> {
        self.check_available()?;
        self.cells.lock().clear();
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Cell>, StoreError> {
        Ok(self.cells.lock().values().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Color;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let a = Cell::new(1, 0, Color::BLACK);
        let b = Cell::new(0, 1, Color::WHITE);

        store.persist(&b).unwrap();
        store.persist(&a).unwrap();
        assert_eq!(store.load_all().unwrap(), vec![a, b]);

        store.delete_persisted(1, 0).unwrap();
        assert_eq!(store.load_all().unwrap(), vec![b]);

        store.clear_all_persisted().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_overwrite() {
        let store = MemoryStore::new();
        let mut cell = Cell::new(2, 2, Color::BLACK);
        store.persist(&cell).unwrap();
        cell.color = Color::WHITE;
        store.persist(&cell).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(2, 2).unwrap().color, Color::WHITE);
    }

    #[test]
    fn test_memory_store_fault_injection() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.persist(&Cell::new(0, 0, Color::BLACK)),
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.is_empty());

        store.set_failing(false);
        assert!(store.persist(&Cell::new(0, 0, Color::BLACK)).is_ok());
    }
}

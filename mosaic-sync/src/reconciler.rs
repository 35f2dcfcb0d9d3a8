//! Per-observer replica of the grid.
//!
//! A [`Replica`] starts from a [`Snapshot`] and applies the live event
//! stream in arrival order. It is a read-only projection: nothing here is
//! ever written back into the engine.
//!
//! Events at or below the replica's sequence are already reflected in it
//! and are skipped, so a stream that overlaps the snapshot boundary is
//! harmless. Upserts of unknown cells and deletes of missing cells are
//! tolerated rather than treated as errors.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::bus::Subscription;
use crate::cell::{Cell, Mutation, MutationEvent};
use crate::engine::{Snapshot, SyncEngine};
use crate::error::SyncError;

/// Local copy of the grid, keyed row-major by `(y, x)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    cells: BTreeMap<(u32, u32), Cell>,
    sequence: u64,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            cells: snapshot.cells.iter().map(|c| ((c.y, c.x), *c)).collect(),
            sequence: snapshot.sequence,
        }
    }

    /// Apply one event. Returns whether the replica changed.
    pub fn apply(&mut self, event: &MutationEvent) -> bool {
        if event.sequence <= self.sequence {
            log::trace!(
                "Skipping sequence {} (replica at {})",
                event.sequence,
                self.sequence
            );
            return false;
        }
        self.sequence = event.sequence;

        match &event.mutation {
            Mutation::Insert(cell) | Mutation::Update(cell) => {
                self.cells.insert((cell.y, cell.x), *cell) != Some(*cell)
            }
            Mutation::Delete { cell_id, x, y } => match self.cells.get(&(*y, *x)) {
                Some(existing) if existing.id == *cell_id => {
                    self.cells.remove(&(*y, *x));
                    true
                }
                _ => false,
            },
            Mutation::ClearAll => {
                let changed = !self.cells.is_empty();
                self.cells.clear();
                changed
            }
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<&Cell> {
        self.cells.get(&(y, x))
    }

    pub fn find(&self, cell_id: Uuid) -> Option<&Cell> {
        self.cells.values().find(|c| c.id == cell_id)
    }

    /// All cells in row-major order.
    pub fn cells(&self) -> Vec<Cell> {
        self.cells.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Sequence of the last event reflected here.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// An in-process observer: a replica kept current from an engine subscription.
pub struct ClientReconciler {
    observer_id: Uuid,
    replica: Replica,
    subscription: Subscription,
}

impl ClientReconciler {
    /// Join the engine and build the initial replica.
    pub fn connect(engine: &SyncEngine, observer_id: Uuid) -> Self {
        let (snapshot, subscription) = engine.join(observer_id);
        Self {
            observer_id,
            replica: Replica::from_snapshot(&snapshot),
            subscription,
        }
    }

    /// Wait for the next event and apply it.
    pub async fn next(&mut self) -> Result<MutationEvent, SyncError> {
        let event = self.subscription.recv().await?;
        self.replica.apply(&event);
        Ok((*event).clone())
    }

    /// Apply every event already queued. Returns how many were applied.
    pub fn drain(&mut self) -> Result<usize, SyncError> {
        let mut applied = 0;
        while let Some(event) = self.subscription.try_recv()? {
            self.replica.apply(&event);
            applied += 1;
        }
        Ok(applied)
    }

    /// Rejoin after the bus dropped this observer and rebuild from scratch.
    pub fn resync(&mut self, engine: &SyncEngine) {
        log::info!("Observer {} resyncing from a fresh snapshot", self.observer_id);
        let (snapshot, subscription) = engine.join(self.observer_id);
        self.replica = Replica::from_snapshot(&snapshot);
        self.subscription = subscription;
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn observer_id(&self) -> Uuid {
        self.observer_id
    }
}

//! Ordered, off-lock persistence of committed mutations.
//!
//! The engine enqueues every committed event from inside its commit
//! section (an unbounded send never waits), so the queue is in commit
//! order. A single blocking task drains it and applies each event to the
//! store. Store I/O therefore never runs under an engine lock, and the
//! durable state converges to the same last-writer-wins result as memory.
//!
//! Reconciliation passes travel through the same queue. A pass compares the
//! store against a snapshot taken in the commit section, so it sees exactly
//! the events up to that snapshot and none after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cell::{Cell, Mutation, MutationEvent};
use crate::engine::{ReconcileReport, Snapshot};
use crate::storage::{PixelStore, StoreError};

type ReconcileReply = oneshot::Sender<Result<ReconcileReport, StoreError>>;

enum Job {
    Apply(MutationEvent),
    Flush(oneshot::Sender<()>),
    Reconcile(Snapshot, ReconcileReply),
}

/// Handle to the background persistence task.
pub struct PersistenceWorker {
    sender: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
    failures: Arc<AtomicU64>,
}

impl PersistenceWorker {
    /// Spawn the worker on the current Tokio runtime.
    pub fn spawn(store: Arc<dyn PixelStore>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let failures = Arc::new(AtomicU64::new(0));

        let task_failures = failures.clone();
        let handle = tokio::task::spawn_blocking(move || {
            while let Some(job) = receiver.blocking_recv() {
                match job {
                    Job::Apply(event) => {
                        if let Err(e) = apply(store.as_ref(), &event) {
                            task_failures.fetch_add(1, Ordering::Relaxed);
                            log::error!(
                                "Failed to persist sequence {}: {e}; store will be repaired by reconciliation",
                                event.sequence
                            );
                        }
                    }
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                    Job::Reconcile(snapshot, done) => {
                        let _ = done.send(reconcile(store.as_ref(), &snapshot));
                    }
                }
            }
            log::debug!("Persistence worker stopped");
        });

        Self {
            sender,
            handle,
            failures,
        }
    }

    /// Queue a committed event. Never blocks.
    pub fn enqueue(&self, event: MutationEvent) {
        if self.sender.send(Job::Apply(event)).is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Persistence worker is gone, event not persisted");
        }
    }

    /// Wait until everything enqueued so far has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Job::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Queue a reconciliation pass against `snapshot`.
    ///
    /// Call from the commit section that took the snapshot, so the pass
    /// lands between the last event it covers and the first it does not.
    pub fn enqueue_reconcile(
        &self,
        snapshot: Snapshot,
    ) -> oneshot::Receiver<Result<ReconcileReport, StoreError>> {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Job::Reconcile(snapshot, done)).is_err() {
            log::error!("Persistence worker is gone, reconciliation skipped");
        }
        wait
    }

    /// Number of events that failed to persist.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Drain the queue and stop the task.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.handle.await {
            log::error!("Persistence worker panicked: {e}");
        }
    }
}

/// Apply one committed mutation to the store.
pub fn apply(store: &dyn PixelStore, event: &MutationEvent) -> Result<(), StoreError> {
    match &event.mutation {
        Mutation::Insert(cell) | Mutation::Update(cell) => store.persist(cell),
        Mutation::Delete { x, y, .. } => store.delete_persisted(*x, *y),
        Mutation::ClearAll => store.clear_all_persisted(),
    }
}

/// Make `store` hold exactly the cells of `snapshot`.
fn reconcile(store: &dyn PixelStore, snapshot: &Snapshot) -> Result<ReconcileReport, StoreError> {
    let persisted = store.load_all()?;
    let mut report = ReconcileReport::default();

    let live: HashMap<(u32, u32), &Cell> = snapshot.cells.iter().map(|c| (c.coord(), c)).collect();
    for stored in &persisted {
        if !live.contains_key(&stored.coord()) {
            store.delete_persisted(stored.x, stored.y)?;
            report.removed += 1;
        }
    }

    let stored: HashMap<(u32, u32), &Cell> = persisted.iter().map(|c| (c.coord(), c)).collect();
    for cell in &snapshot.cells {
        if stored.get(&cell.coord()) != Some(&cell) {
            store.persist(cell)?;
            report.repaired += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Color;
    use crate::storage::MemoryStore;

    fn snapshot_of(cells: Vec<Cell>) -> Snapshot {
        Snapshot {
            sequence: 1,
            width: 4,
            height: 4,
            cells,
        }
    }

    #[tokio::test]
    async fn test_worker_applies_in_order() {
        let store = Arc::new(MemoryStore::new());
        let worker = PersistenceWorker::spawn(store.clone());

        let mut cell = Cell::new(1, 1, Color::BLACK);
        worker.enqueue(MutationEvent::new(1, Mutation::Insert(cell)));
        cell.color = Color::WHITE;
        worker.enqueue(MutationEvent::new(2, Mutation::Update(cell)));
        worker.enqueue(MutationEvent::new(
            3,
            Mutation::Insert(Cell::new(2, 2, Color::BLACK)),
        ));
        worker.enqueue(MutationEvent::new(
            4,
            Mutation::Delete { cell_id: cell.id, x: 1, y: 1 },
        ));
        worker.flush().await;

        assert_eq!(store.len(), 1);
        assert!(store.get(1, 1).is_none());
        assert_eq!(worker.failures(), 0);

        worker.enqueue(MutationEvent::new(5, Mutation::ClearAll));
        worker.shutdown().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_worker_counts_failures() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let worker = PersistenceWorker::spawn(store.clone());

        worker.enqueue(MutationEvent::new(
            1,
            Mutation::Insert(Cell::new(0, 0, Color::BLACK)),
        ));
        worker.flush().await;

        assert_eq!(worker.failures(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_reconcile_repairs_store() {
        let store = MemoryStore::new();
        store.persist(&Cell::new(3, 3, Color::WHITE)).unwrap();

        let grid_cell = Cell::new(0, 0, Color::BLACK);
        let snapshot = snapshot_of(vec![grid_cell]);

        let report = reconcile(&store, &snapshot).unwrap();
        assert_eq!(report, ReconcileReport { repaired: 1, removed: 1 });
        assert_eq!(store.load_all().unwrap(), vec![grid_cell]);

        // Already in sync
        assert_eq!(reconcile(&store, &snapshot).unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_reconcile_runs_in_queue_order() {
        let store = Arc::new(MemoryStore::new());
        let worker = PersistenceWorker::spawn(store.clone());

        let cell = Cell::new(1, 1, Color::BLACK);
        worker.enqueue(MutationEvent::new(1, Mutation::Insert(cell)));
        let pending = worker.enqueue_reconcile(snapshot_of(vec![cell]));
        worker.enqueue(MutationEvent::new(
            2,
            Mutation::Delete { cell_id: cell.id, x: 1, y: 1 },
        ));

        // The insert was applied before the pass, the delete after it
        let report = pending.await.unwrap().unwrap();
        assert_eq!(report, ReconcileReport::default());
        worker.flush().await;
        assert!(store.is_empty());
    }
}

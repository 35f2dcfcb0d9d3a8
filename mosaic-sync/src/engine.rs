//! The sync engine: admission, commit, sequencing and publish.
//!
//! Pipeline per request:
//! ```text
//! Received ──► AuthorizationChecked ──► CooldownChecked ──► Committed ──► Published
//!    │                 │                       │
//!    ▼                 ▼                       ▼
//! InvalidCoordinate  Unauthorized          RateLimited
//! InvalidColor
//! ```
//!
//! Committed and Published happen together inside the commit section, a
//! short mutex-guarded region holding the sequence counter. Inside it the
//! engine mutates the grid, assigns the next sequence, pushes the event
//! into every observer queue and into the persistence queue; none of these
//! wait or do I/O. Commit order, sequence order and delivery order are
//! therefore the same total order, and `join` can take a snapshot that
//! lines up exactly with a subscription's starting sequence.
//!
//! Lock order: commit section → grid slot → bus registry. Admission
//! (per-client lock) happens before the commit section and never nests
//! inside it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::bus::{BusStats, EventBus, Subscription};
use crate::cell::{Cell, Color, Mutation, MutationEvent};
use crate::config::GridConfig;
use crate::cooldown::{Admission, ClientSession, CooldownTracker};
use crate::error::SyncError;
use crate::grid::{GridStore, Placement};
use crate::privilege::{Operation, PrivilegeGate, Role};
use crate::storage::{PersistenceWorker, PixelStore, StoreError};

/// Who is asking, as vouched for by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: Uuid,
    pub role: Role,
}

impl ClientIdentity {
    pub fn new(client_id: Uuid, role: Role) -> Self {
        Self { client_id, role }
    }
}

/// What the client wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Paint { x: u32, y: u32, color: Color },
    Erase { x: u32, y: u32 },
    ClearGrid,
    SetBypass { enabled: bool },
}

impl Command {
    /// Capability the command needs from [`PrivilegeGate`].
    pub fn operation(&self) -> Operation {
        match self {
            Command::Paint { .. } => Operation::WriteCell,
            Command::Erase { .. } => Operation::DeleteCell,
            Command::ClearGrid => Operation::ClearGrid,
            Command::SetBypass { .. } => Operation::BypassCooldown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub identity: ClientIdentity,
    pub command: Command,
}

impl WriteRequest {
    pub fn new(identity: ClientIdentity, command: Command) -> Self {
        Self { identity, command }
    }

    pub fn paint(identity: ClientIdentity, x: u32, y: u32, color: Color) -> Self {
        Self::new(identity, Command::Paint { x, y, color })
    }

    pub fn erase(identity: ClientIdentity, x: u32, y: u32) -> Self {
        Self::new(identity, Command::Erase { x, y })
    }

    pub fn clear(identity: ClientIdentity) -> Self {
        Self::new(identity, Command::ClearGrid)
    }
}

/// Successful result of [`SyncEngine::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The grid changed and this event was published.
    Committed(MutationEvent),
    /// Accepted but nothing to change (erasing an empty coordinate).
    Unchanged,
    /// The client's cooldown exemption was switched.
    BypassChanged { enabled: bool },
}

impl Outcome {
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Outcome::Committed(event) => Some(event.sequence),
            _ => None,
        }
    }
}

/// Consistent grid state handed to a newly joined observer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    /// Every commit with a sequence up to this one is reflected in `cells`.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub cells: Vec<Cell>,
}

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub committed: u64,
    pub rejected_unauthorized: u64,
    pub rejected_rate_limited: u64,
    pub rejected_invalid: u64,
    pub persistence_failures: u64,
}

#[derive(Default)]
struct AtomicEngineStats {
    committed: AtomicU64,
    rejected_unauthorized: AtomicU64,
    rejected_rate_limited: AtomicU64,
    rejected_invalid: AtomicU64,
}

/// Result of [`SyncEngine::reconcile_store`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Cells written because the store was missing or had a stale copy.
    pub repaired: usize,
    /// Stored cells deleted because the grid no longer has them.
    pub removed: usize,
}

/// The authoritative engine for one grid.
pub struct SyncEngine {
    config: GridConfig,
    grid: GridStore,
    cooldown: CooldownTracker,
    bus: EventBus,
    /// Commit section: last assigned sequence.
    commit: Mutex<u64>,
    persistence: Option<PersistenceWorker>,
    stats: AtomicEngineStats,
}

impl SyncEngine {
    /// In-memory engine without durable storage.
    pub fn new(config: GridConfig) -> Self {
        Self {
            grid: GridStore::new(config.dimensions()),
            cooldown: CooldownTracker::new(config.cooldown()),
            bus: EventBus::new(config.observer_queue_capacity),
            commit: Mutex::new(0),
            persistence: None,
            stats: AtomicEngineStats::default(),
            config,
        }
    }

    /// Engine backed by `store`: rehydrates the grid from it, then
    /// persists every commit through a background worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_store(config: GridConfig, store: Arc<dyn PixelStore>) -> Result<Self, SyncError> {
        let mut engine = Self::new(config);
        engine.rehydrate(store.as_ref())?;
        engine.persistence = Some(PersistenceWorker::spawn(store));
        Ok(engine)
    }

    /// Load persisted cells into the grid. Returns how many were loaded.
    pub fn rehydrate(&self, store: &dyn PixelStore) -> Result<usize, SyncError> {
        let cells = store.load_all()?;
        let total = cells.len();
        let _section = self.commit.lock();
        let loaded = self.grid.load(cells);
        log::info!("Rehydrated {loaded}/{total} cells from storage");
        Ok(loaded)
    }

    // ─── Write pipeline ───────────────────────────────────────────────

    /// Run a request through the pipeline at the current time.
    pub fn submit(&self, request: WriteRequest) -> Result<Outcome, SyncError> {
        self.submit_at(request, Instant::now())
    }

    /// Run a request through the pipeline as if it arrived at `now`.
    pub fn submit_at(&self, request: WriteRequest, now: Instant) -> Result<Outcome, SyncError> {
        let result = self.run_pipeline(request, now);
        if let Err(e) = &result {
            self.record_rejection(&request, e);
        }
        result
    }

    fn run_pipeline(&self, request: WriteRequest, now: Instant) -> Result<Outcome, SyncError> {
        let WriteRequest { identity, command } = request;

        // Received
        self.validate(&command)?;

        // AuthorizationChecked
        PrivilegeGate::require(identity.role, command.operation())?;

        // CooldownChecked: a bypass set earlier only counts while the
        // requesting role may still bypass
        if let Command::Paint { .. } = command {
            let honor_bypass = PrivilegeGate::authorize(identity.role, Operation::BypassCooldown);
            if let Admission::Rejected { remaining } =
                self.cooldown.try_admit_with(identity.client_id, now, honor_bypass)
            {
                return Err(SyncError::RateLimited { remaining });
            }
        }

        // Committed + Published
        let outcome = match command {
            Command::Paint { x, y, color } => {
                let event = self.commit(|sequence| {
                    let mutation = match self.grid.put(x, y, color)? {
                        Placement::Inserted(cell) => Mutation::Insert(cell),
                        Placement::Updated(cell) => Mutation::Update(cell),
                    };
                    Ok(Some(MutationEvent::new(sequence, mutation)))
                })?;
                event.map_or(Outcome::Unchanged, Outcome::Committed)
            }
            Command::Erase { x, y } => {
                let event = self.commit(|sequence| {
                    Ok(self.grid.delete(x, y)?.map(|cell| {
                        MutationEvent::new(
                            sequence,
                            Mutation::Delete {
                                cell_id: cell.id,
                                x,
                                y,
                            },
                        )
                    }))
                })?;
                event.map_or(Outcome::Unchanged, Outcome::Committed)
            }
            Command::ClearGrid => {
                let event = self.commit(|sequence| {
                    let removed = self.grid.clear();
                    log::info!("Client {} cleared the grid ({removed} cells)", identity.client_id);
                    Ok(Some(MutationEvent::new(sequence, Mutation::ClearAll)))
                })?;
                event.map_or(Outcome::Unchanged, Outcome::Committed)
            }
            Command::SetBypass { enabled } => {
                if enabled {
                    self.cooldown.bypass(identity.client_id);
                } else {
                    self.cooldown.clear_bypass(identity.client_id);
                }
                log::info!("Client {} cooldown bypass set to {enabled}", identity.client_id);
                Outcome::BypassChanged { enabled }
            }
        };

        Ok(outcome)
    }

    /// Run `mutate` inside the commit section with the sequence it would
    /// receive. If it produces an event, the sequence is consumed and the
    /// event is published and handed to persistence before the section ends.
    fn commit<F>(&self, mutate: F) -> Result<Option<MutationEvent>, SyncError>
    where
        F: FnOnce(u64) -> Result<Option<MutationEvent>, SyncError>,
    {
        let mut last = self.commit.lock();
        let Some(event) = mutate(*last + 1)? else {
            return Ok(None);
        };

        *last = event.sequence;
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        if let Some(worker) = &self.persistence {
            worker.enqueue(event.clone());
        }
        self.bus.publish(event.clone());
        Ok(Some(event))
    }

    fn validate(&self, command: &Command) -> Result<(), SyncError> {
        let dimensions = self.grid.dimensions();
        match *command {
            Command::Paint { x, y, color } => {
                dimensions.check(x, y)?;
                if let Some(palette) = &self.config.palette {
                    if !palette.contains(&color) {
                        return Err(SyncError::InvalidColor(format!("{color} is not in the palette")));
                    }
                }
                Ok(())
            }
            Command::Erase { x, y } => dimensions.check(x, y),
            Command::ClearGrid | Command::SetBypass { .. } => Ok(()),
        }
    }

    fn record_rejection(&self, request: &WriteRequest, error: &SyncError) {
        let client = request.identity.client_id;
        match error {
            SyncError::Unauthorized { role, operation } => {
                self.stats.rejected_unauthorized.fetch_add(1, Ordering::Relaxed);
                log::debug!("Rejected {operation:?} from {client} ({role:?}): unauthorized");
            }
            SyncError::RateLimited { remaining } => {
                self.stats.rejected_rate_limited.fetch_add(1, Ordering::Relaxed);
                log::debug!("Rejected write from {client}: {}ms cooldown left", remaining.as_millis());
            }
            SyncError::InvalidCoordinate { .. } | SyncError::InvalidColor(_) => {
                self.stats.rejected_invalid.fetch_add(1, Ordering::Relaxed);
                log::warn!("Protocol violation from {client}: {error}");
            }
            other => log::error!("Request from {client} failed: {other}"),
        }
    }

    // ─── Observers ────────────────────────────────────────────────────

    /// Subscribe `observer_id` and snapshot the grid at the same point in
    /// the commit order.
    ///
    /// The snapshot holds exactly the commits up to
    /// `subscription.initial_sequence()`; the subscription delivers
    /// exactly the commits after it.
    pub fn join(&self, observer_id: Uuid) -> (Snapshot, Subscription) {
        let section = self.commit.lock();
        let subscription = self.bus.subscribe(observer_id);
        let snapshot = self.snapshot_at(*section);
        drop(section);

        debug_assert_eq!(snapshot.sequence, subscription.initial_sequence());
        log::debug!(
            "Observer {observer_id} joined at sequence {} with {} cells",
            snapshot.sequence,
            snapshot.cells.len()
        );
        (snapshot, subscription)
    }

    /// Unsubscribe the observer and discard the client's admission state.
    pub fn leave(&self, observer_id: Uuid) {
        self.bus.unsubscribe(&observer_id);
        self.cooldown.forget(observer_id);
    }

    /// Drop a connection's subscription. The client's session is only
    /// forgotten if no newer subscription has claimed the same id.
    pub fn disconnect(&self, subscription: Subscription) {
        let observer_id = subscription.observer_id();
        if self.bus.release(&subscription) {
            self.cooldown.forget(observer_id);
        } else {
            log::debug!("Observer {observer_id} was superseded by a newer connection");
        }
    }

    // ─── Read accessors ───────────────────────────────────────────────

    pub fn get(&self, x: u32, y: u32) -> Option<Cell> {
        self.grid.get(x, y)
    }

    /// Snapshot without subscribing.
    pub fn snapshot(&self) -> Snapshot {
        let section = self.commit.lock();
        self.snapshot_at(*section)
    }

    /// Grid contents labeled with `sequence`. The caller holds the commit
    /// section.
    fn snapshot_at(&self, sequence: u64) -> Snapshot {
        let dimensions = self.grid.dimensions();
        Snapshot {
            sequence,
            width: dimensions.width,
            height: dimensions.height,
            cells: self.grid.snapshot(),
        }
    }

    /// Sequence of the most recent commit.
    pub fn sequence(&self) -> u64 {
        *self.commit.lock()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Number of subscribed observers.
    pub fn observer_count(&self) -> usize {
        self.bus.observer_count()
    }

    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    /// Copy of the client's admission state, if it has one.
    pub fn session(&self, client_id: Uuid) -> Option<ClientSession> {
        self.cooldown.session(client_id)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            committed: self.stats.committed.load(Ordering::Relaxed),
            rejected_unauthorized: self.stats.rejected_unauthorized.load(Ordering::Relaxed),
            rejected_rate_limited: self.stats.rejected_rate_limited.load(Ordering::Relaxed),
            rejected_invalid: self.stats.rejected_invalid.load(Ordering::Relaxed),
            persistence_failures: self.persistence.as_ref().map_or(0, |w| w.failures()),
        }
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Wait until every commit so far has reached the store.
    pub async fn flush_persistence(&self) {
        if let Some(worker) = &self.persistence {
            worker.flush().await;
        }
    }

    /// Compare the store against the grid and repair the differences.
    ///
    /// The pass runs on the persistence worker, ordered after every commit
    /// it covers and before every later one, so it never overwrites a newer
    /// write. Without a store this is a no-op.
    pub async fn reconcile_store(&self) -> Result<ReconcileReport, SyncError> {
        let Some(worker) = &self.persistence else {
            return Ok(ReconcileReport::default());
        };

        let pending = {
            let section = self.commit.lock();
            worker.enqueue_reconcile(self.snapshot_at(*section))
        };
        let report = pending
            .await
            .map_err(|_| StoreError::Unavailable("persistence worker stopped".into()))??;

        if report != ReconcileReport::default() {
            log::warn!(
                "Store reconciliation repaired {} cells and removed {}",
                report.repaired,
                report.removed
            );
        }
        Ok(report)
    }

    /// Stop the persistence worker after draining its queue.
    pub async fn shutdown(mut self) {
        if let Some(worker) = self.persistence.take() {
            worker.shutdown().await;
        }
    }
}

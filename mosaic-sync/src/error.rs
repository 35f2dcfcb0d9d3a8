//! Error taxonomy for the sync engine.
//!
//! Every variant is scoped to a single request or a single observer;
//! none of them is fatal to the process.

use std::time::Duration;
use uuid::Uuid;

use crate::privilege::{Operation, Role};
use crate::storage::StoreError;

/// Errors surfaced by the engine, the event bus and the reconciler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// The role lacks the privilege for the requested operation.
    #[error("role {role:?} may not perform {operation:?}")]
    Unauthorized { role: Role, operation: Operation },

    /// The client's cooldown is still running.
    #[error("rate limited, retry in {}ms", remaining.as_millis())]
    RateLimited { remaining: Duration },

    /// Coordinates fall outside the grid.
    #[error("coordinate ({x}, {y}) outside {width}x{height} grid")]
    InvalidCoordinate { x: u32, y: u32, width: u32, height: u32 },

    /// Color could not be parsed or is not in the configured palette.
    #[error("invalid color: {0}")]
    InvalidColor(String),

    /// The durable store failed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// The observer's queue overflowed and it was disconnected.
    #[error("observer {observer} overflowed and must resubscribe")]
    ObserverOverflow { observer: Uuid },

    /// The observer was unsubscribed.
    #[error("observer {observer} is no longer subscribed")]
    ObserverClosed { observer: Uuid },
}

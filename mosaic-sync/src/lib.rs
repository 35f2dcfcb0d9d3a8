//! # mosaic-sync — Real-time shared pixel grid
//!
//! Many clients paint cells on one fixed-size grid. The server admits
//! writes under per-client cooldowns and role privileges, commits them in
//! a single total order and streams every commit to every observer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ GridClient  │ ◄─────────────────► │ GridServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Replica     │ ◄── Event stream ── │ SyncEngine  │
//! │ (local)     │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                          ┌─────────────┬───┴─────────┬───────────────┐
//!                          ▼             ▼             ▼               ▼
//!                    ┌──────────┐ ┌─────────────┐ ┌──────────┐ ┌──────────────┐
//!                    │GridStore │ │CooldownTrack│ │ EventBus │ │ PixelStore   │
//!                    │(per-cell)│ │(per-client) │ │ (fan-out)│ │ (RocksDB)    │
//!                    └──────────┘ └─────────────┘ └──────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`cell`] — Colors, cells, mutations and sequenced events
//! - [`grid`] — Authoritative grid with per-coordinate locking
//! - [`cooldown`] — Per-client write admission
//! - [`privilege`] — Role → operation capability table
//! - [`bus`] — Per-observer bounded event queues
//! - [`engine`] — Request pipeline, commit order and observer join
//! - [`reconciler`] — Client-side replica kept current from the stream
//! - [`storage`] — Durable storage behind an ordered persistence worker
//! - [`protocol`] — Binary wire protocol (bincode, LZ4 snapshots)
//! - [`server`] / [`client`] — WebSocket transport
//! - [`config`] — TOML configuration

pub mod bus;
pub mod cell;
pub mod client;
pub mod config;
pub mod cooldown;
pub mod engine;
pub mod error;
pub mod grid;
pub mod privilege;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use bus::{BusStats, EventBus, Subscription};
pub use cell::{Cell, Color, Mutation, MutationEvent};
pub use client::{ClientEvent, ConnectionState, GridClient};
pub use config::{ConfigError, GridConfig, MosaicConfig, ServerConfig};
pub use cooldown::{Admission, ClientSession, CooldownTracker};
pub use engine::{
    ClientIdentity, Command, EngineStats, Outcome, ReconcileReport, Snapshot, SyncEngine,
    WriteRequest,
};
pub use error::SyncError;
pub use grid::{GridDimensions, GridStore, Placement};
pub use privilege::{Operation, PrivilegeGate, Role};
pub use protocol::{ClientMessage, ProtocolError, RejectReason, ServerMessage};
pub use reconciler::{ClientReconciler, Replica};
pub use server::{GridServer, ServerStats};
pub use storage::{MemoryStore, PixelStore, RocksStore, StoreConfig, StoreError};

//! Binary protocol between grid clients and the server.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! ```text
//! client ──► server                 server ──► client
//! ─────────────────                 ─────────────────
//! Hello { client_id, role }         Welcome { snapshot }   (LZ4 + bincode)
//! Paint { x, y, color }             Event(MutationEvent)
//! Erase { x, y }                    Accepted { sequence }
//! ClearGrid                         Rejected { reason }
//! SetBypass { enabled }             Overflow               (then close)
//! Ping                              Pong
//! ```
//!
//! The first client frame must be `Hello`; anything else before it is
//! answered with `Rejected { reason: NotIdentified }`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::cell::{Color, MutationEvent};
use crate::engine::{Command, Outcome, Snapshot};
use crate::error::SyncError;
use crate::privilege::Role;

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Identify the connection. Trusted as given.
    Hello { client_id: Uuid, role: Role },
    Paint { x: u32, y: u32, color: Color },
    Erase { x: u32, y: u32 },
    ClearGrid,
    SetBypass { enabled: bool },
    Ping,
}

impl ClientMessage {
    /// The engine command this message asks for, if any.
    pub fn command(&self) -> Option<Command> {
        match *self {
            ClientMessage::Paint { x, y, color } => Some(Command::Paint { x, y, color }),
            ClientMessage::Erase { x, y } => Some(Command::Erase { x, y }),
            ClientMessage::ClearGrid => Some(Command::ClearGrid),
            ClientMessage::SetBypass { enabled } => Some(Command::SetBypass { enabled }),
            ClientMessage::Hello { .. } | ClientMessage::Ping => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Why a request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Unauthorized,
    RateLimited { remaining_ms: u64 },
    InvalidCoordinate,
    InvalidColor,
    /// A request arrived before `Hello`.
    NotIdentified,
    /// Server-side failure unrelated to the request itself.
    Internal,
}

impl RejectReason {
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            RejectReason::RateLimited { remaining_ms } => Some(Duration::from_millis(*remaining_ms)),
            _ => None,
        }
    }
}

impl From<&SyncError> for RejectReason {
    fn from(error: &SyncError) -> Self {
        match error {
            SyncError::Unauthorized { .. } => RejectReason::Unauthorized,
            SyncError::RateLimited { remaining } => RejectReason::RateLimited {
                // Round up so a client never retries a hair too early
                remaining_ms: remaining.as_nanos().div_ceil(1_000_000) as u64,
            },
            SyncError::InvalidCoordinate { .. } => RejectReason::InvalidCoordinate,
            SyncError::InvalidColor(_) => RejectReason::InvalidColor,
            _ => RejectReason::Internal,
        }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Initial grid state. Use [`ServerMessage::welcome`] and
    /// [`ServerMessage::snapshot`] rather than touching the bytes.
    Welcome { snapshot: Vec<u8> },
    Event(MutationEvent),
    /// Request accepted. `sequence` is set when it produced an event.
    Accepted { sequence: Option<u64> },
    Rejected { reason: RejectReason },
    /// The connection fell too far behind and is being closed.
    Overflow,
    Pong,
}

impl ServerMessage {
    pub fn welcome(snapshot: &Snapshot) -> Result<Self, ProtocolError> {
        Ok(ServerMessage::Welcome {
            snapshot: compress_snapshot(snapshot)?,
        })
    }

    pub fn accepted(outcome: &Outcome) -> Self {
        ServerMessage::Accepted {
            sequence: outcome.sequence(),
        }
    }

    pub fn rejected(error: &SyncError) -> Self {
        ServerMessage::Rejected {
            reason: error.into(),
        }
    }

    /// Decode the snapshot carried by a `Welcome`.
    pub fn snapshot(&self) -> Result<Snapshot, ProtocolError> {
        match self {
            ServerMessage::Welcome { snapshot } => decompress_snapshot(snapshot),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// bincode-encode then LZ4-compress a snapshot.
pub fn compress_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, ProtocolError> {
    let raw = encode(snapshot)?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub fn decompress_snapshot(bytes: &[u8]) -> Result<Snapshot, ProtocolError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    decode(&raw)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

//! WebSocket client for a grid server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect after overflow)
//! - Paint / erase / clear / bypass requests
//! - A local [`Replica`] fed from `Welcome` and `Event` messages
//!
//! Requests are not queued while disconnected. A rejected or unsent
//! request is the caller's to retry.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::cell::{Color, MutationEvent};
use crate::privilege::Role;
use crate::protocol::{ClientMessage, ProtocolError, RejectReason, ServerMessage};
use crate::reconciler::Replica;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the grid client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established and `Hello` sent
    Connected,
    /// Snapshot received; the replica now reflects this sequence
    Synced { sequence: u64, cells: usize },
    /// A committed mutation, already applied to the replica
    Mutation(MutationEvent),
    /// One of our requests was accepted
    Accepted { sequence: Option<u64> },
    /// One of our requests was turned down
    Rejected(RejectReason),
    /// Server answered a ping
    Pong,
    /// We fell behind and the server dropped us; reconnect to resync
    Overflowed,
    /// Connection lost
    Disconnected,
}

/// The grid client.
pub struct GridClient {
    client_id: Uuid,
    role: Role,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Local copy of the grid
    replica: Arc<RwLock<Replica>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Server URL
    server_url: String,
}

impl GridClient {
    pub fn new(client_id: Uuid, role: Role, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id,
            role,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(RwLock::new(Replica::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and identify. The replica is rebuilt from the `Welcome`
    /// snapshot, so calling this again after an overflow resyncs.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Handshake(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            // Client dropped the sender: close politely
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let hello = ClientMessage::Hello {
            client_id: self.client_id,
            role: self.role,
        };
        out_tx
            .send(hello.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        notify(&self.event_tx, self.client_id, ClientEvent::Connected);

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let replica = self.replica.clone();
        let client_id = self.client_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let server_msg = match ServerMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Client {client_id} got an undecodable frame: {e}");
                                continue;
                            }
                        };

                        let event = match server_msg {
                            ServerMessage::Welcome { .. } => match server_msg.snapshot() {
                                Ok(snapshot) => {
                                    let fresh = Replica::from_snapshot(&snapshot);
                                    let event = ClientEvent::Synced {
                                        sequence: fresh.sequence(),
                                        cells: fresh.len(),
                                    };
                                    *replica.write().await = fresh;
                                    Some(event)
                                }
                                Err(e) => {
                                    log::error!("Client {client_id} could not read snapshot: {e}");
                                    None
                                }
                            },
                            ServerMessage::Event(event) => {
                                replica.write().await.apply(&event);
                                Some(ClientEvent::Mutation(event))
                            }
                            ServerMessage::Accepted { sequence } => {
                                Some(ClientEvent::Accepted { sequence })
                            }
                            ServerMessage::Rejected { reason } => Some(ClientEvent::Rejected(reason)),
                            ServerMessage::Pong => Some(ClientEvent::Pong),
                            ServerMessage::Overflow => {
                                log::warn!("Client {client_id} overflowed, server is closing");
                                Some(ClientEvent::Overflowed)
                            }
                        };

                        if let Some(evt) = event {
                            notify(&event_tx, client_id, evt);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            notify(&event_tx, client_id, ClientEvent::Disconnected);
        });

        Ok(())
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        // Dropping the sender ends the writer task, which sends Close
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn paint(&self, x: u32, y: u32, color: Color) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Paint { x, y, color }).await
    }

    pub async fn erase(&self, x: u32, y: u32) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Erase { x, y }).await
    }

    pub async fn clear_grid(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::ClearGrid).await
    }

    pub async fn set_bypass(&self, enabled: bool) -> Result<(), ProtocolError> {
        self.send(ClientMessage::SetBypass { enabled }).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// A copy of the local replica.
    pub async fn replica(&self) -> Replica {
        self.replica.read().await.clone()
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Hand an event to the application without waiting. The replica is
/// updated before this is called, so a slow or absent reader only loses
/// notifications.
fn notify(event_tx: &mpsc::Sender<ClientEvent>, client_id: Uuid, event: ClientEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::debug!("Client {client_id} event queue full, dropping {event:?}");
        }
        // Nobody took the receiver, or it was dropped
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let id = Uuid::new_v4();
        let client = GridClient::new(id, Role::Authenticated, "ws://localhost:9090");

        assert_eq!(client.client_id(), id);
        assert_eq!(client.role(), Role::Authenticated);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = GridClient::new(Uuid::new_v4(), Role::Anonymous, "ws://localhost:9090");

        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.replica().await.is_empty());
    }

    #[tokio::test]
    async fn test_paint_while_disconnected_fails() {
        let client = GridClient::new(Uuid::new_v4(), Role::Authenticated, "ws://localhost:9090");
        assert_eq!(
            client.paint(0, 0, Color::BLACK).await,
            Err(ProtocolError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is never a grid server
        let mut client = GridClient::new(Uuid::new_v4(), Role::Anonymous, "ws://127.0.0.1:1");
        assert!(matches!(client.connect().await, Err(ProtocolError::Handshake(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_notify_never_blocks_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let id = Uuid::new_v4();
        notify(&tx, id, ClientEvent::Connected);
        notify(&tx, id, ClientEvent::Pong);
        assert_eq!(rx.try_recv().unwrap(), ClientEvent::Connected);
        assert!(rx.try_recv().is_err());

        drop(rx);
        notify(&tx, id, ClientEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = GridClient::new(Uuid::new_v4(), Role::Anonymous, "ws://localhost:9090");

        // First take should succeed
        assert!(client.take_event_rx().is_some());
        // Second take should return None
        assert!(client.take_event_rx().is_none());
    }
}

//! WebSocket front end for one shared grid.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── GridStore
//!             ├── GridServer ── SyncEngine ┼── CooldownTracker
//! Client B ──┘        ▲                 ├── EventBus ──┐
//!                     │                 └── PersistenceWorker ── RocksStore
//!                     │                                 │
//!                     └──── per-connection Subscription ◄┘
//! ```
//!
//! Each connection:
//! 1. waits for `Hello`, then joins the engine and sends `Welcome` with a
//!    snapshot that lines up with its subscription,
//! 2. answers every request with `Accepted` or `Rejected`,
//! 3. forwards committed events from its subscription as `Event`,
//! 4. on observer overflow sends `Overflow` and closes; the client is
//!    expected to reconnect and start from a fresh snapshot.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 11

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::bus::Subscription;
use crate::config::ServerConfig;
use crate::engine::{ClientIdentity, SyncEngine, WriteRequest};
use crate::error::SyncError;
use crate::protocol::{ClientMessage, RejectReason, ServerMessage};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub accepted_requests: u64,
    pub rejected_requests: u64,
    pub overflow_disconnects: u64,
}

/// The grid server.
pub struct GridServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl GridServer {
    pub fn new(engine: Arc<SyncEngine>, config: ServerConfig) -> Self {
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Grid server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.config.reconcile_interval_secs > 0 {
            self.spawn_reconciler(Duration::from_secs(self.config.reconcile_interval_secs));
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Periodically repair the store against the in-memory grid.
    fn spawn_reconciler(&self, period: Duration) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = engine.reconcile_store().await {
                    log::error!("Store reconciliation failed: {e}");
                }
            }
        });
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut identity: Option<ClientIdentity> = None;
        let mut subscription: Option<Subscription> = None;

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                let client_msg = match ClientMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };

                                let reply = match client_msg {
                                    ClientMessage::Hello { client_id, role } => {
                                        if identity.is_some() {
                                            log::warn!("Duplicate Hello from {addr}, ignoring");
                                            continue;
                                        }
                                        let (snapshot, sub) = engine.join(client_id);
                                        identity = Some(ClientIdentity::new(client_id, role));
                                        subscription = Some(sub);
                                        log::info!(
                                            "Client {client_id} ({role:?}) joined from {addr} at sequence {}",
                                            snapshot.sequence
                                        );
                                        ServerMessage::welcome(&snapshot)?
                                    }
                                    ClientMessage::Ping => ServerMessage::Pong,
                                    other => {
                                        let reply = match (identity, other.command()) {
                                            (Some(identity), Some(command)) => {
                                                match engine.submit(WriteRequest::new(identity, command)) {
                                                    Ok(outcome) => ServerMessage::accepted(&outcome),
                                                    Err(e) => ServerMessage::rejected(&e),
                                                }
                                            }
                                            _ => ServerMessage::Rejected {
                                                reason: RejectReason::NotIdentified,
                                            },
                                        };
                                        let mut s = stats.write().await;
                                        match reply {
                                            ServerMessage::Accepted { .. } => s.accepted_requests += 1,
                                            _ => s.rejected_requests += 1,
                                        }
                                        reply
                                    }
                                };
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Committed mutation for this observer
                    event = async {
                        match subscription.as_mut() {
                            Some(sub) => sub.recv().await,
                            // Not joined yet, nothing to forward
                            None => std::future::pending().await,
                        }
                    } => {
                        match event {
                            Ok(event) => {
                                let msg = ServerMessage::Event((*event).clone());
                                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                            }
                            Err(SyncError::ObserverOverflow { observer }) => {
                                log::warn!("Client {observer} fell behind, closing connection from {addr}");
                                stats.write().await.overflow_disconnects += 1;
                                let msg = ServerMessage::Overflow;
                                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                            Err(e) => {
                                log::info!("Stream for {addr} ended: {e}");
                                break;
                            }
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Cleanup runs whether the loop ended cleanly or on a send error
        if let Some(sub) = subscription {
            engine.disconnect(sub);
        }
        stats.write().await.active_connections -= 1;

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;

    fn test_engine() -> Arc<SyncEngine> {
        Arc::new(SyncEngine::new(GridConfig::new(8, 8, Duration::from_secs(10))))
    }

    #[test]
    fn test_server_creation() {
        let server = GridServer::new(test_engine(), ServerConfig::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.engine().sequence(), 0);
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            ..ServerConfig::default()
        };
        let server = GridServer::new(test_engine(), config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = GridServer::new(test_engine(), ServerConfig::default());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.accepted_requests, 0);
        assert_eq!(stats.overflow_disconnects, 0);
    }
}

//! WebSocket relay with room-based frame routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── room "design-review" ── broadcast channel
//! Client B ──┘            │
//!                         ├──► Client A
//!                         └──► Client B
//! ```
//!
//! The relay holds no document state and never inspects payloads: replicas
//! are the source of truth and answer each other's sync requests directly.
//! Each frame is routed to the broadcast channel of the room named in its
//! envelope; a connection is bound to the room of its first frame. Rooms
//! are created lazily and removed once the last subscriber leaves.
//!
//! Reference: Kleppmann — DDIA, Chapter 8 (Broadcast Protocols)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::Envelope;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast channel capacity per room. Slow consumers past this lag
    /// and miss frames; their document resync covers the gap.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

// Frames carry their sender so fan-out can filter echoes without decoding.
type RoomFrame = (Uuid, Arc<Vec<u8>>);

type RoomMap = HashMap<String, broadcast::Sender<RoomFrame>>;

/// The sync relay.
pub struct SyncRelay {
    config: RelayConfig,
    rooms: Arc<RwLock<RoomMap>>,
    stats: Arc<RwLock<RelayStats>>,
}

impl SyncRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the relay accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let capacity = self.config.channel_capacity;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<RoomMap>>,
        stats: Arc<RwLock<RelayStats>>,
        capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Bound on first frame.
        let mut room_id: Option<String> = None;
        let mut replica: Option<Uuid> = None;
        let mut room_tx: Option<broadcast::Sender<RoomFrame>> = None;
        let mut room_rx: Option<broadcast::Receiver<RoomFrame>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let envelope = match Envelope::decode(&bytes) {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    log::warn!("Undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            // First frame binds the connection to its room.
                            if room_id.is_none() {
                                let mut rooms_w = rooms.write().await;
                                let tx = rooms_w
                                    .entry(envelope.room_id.clone())
                                    .or_insert_with(|| broadcast::channel(capacity).0)
                                    .clone();
                                room_rx = Some(tx.subscribe());
                                room_tx = Some(tx);
                                room_id = Some(envelope.room_id.clone());
                                replica = Some(envelope.sender);

                                let room_count = rooms_w.len();
                                drop(rooms_w);
                                stats.write().await.active_rooms = room_count;
                                log::info!(
                                    "Replica {} joined room {:?}",
                                    envelope.sender,
                                    envelope.room_id
                                );
                            } else if room_id.as_deref() != Some(envelope.room_id.as_str()) {
                                log::warn!(
                                    "Frame for room {:?} on a connection bound to {:?}, dropping",
                                    envelope.room_id,
                                    room_id
                                );
                                continue;
                            }

                            if let Some(ref tx) = room_tx {
                                // No subscribers is fine (sender alone in room).
                                let _ = tx.send((envelope.sender, Arc::new(bytes)));
                            }
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

                msg = async {
                    match room_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not bound to a room yet — wait forever.
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok((sender, data)) => {
                            // Don't echo frames back to their sender.
                            if Some(sender) == replica {
                                continue;
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Replica {replica:?} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        // Cleanup: drop our subscription, then remove the room if empty.
        drop(room_rx);
        if let Some(ref rid) = room_id {
            let mut rooms_w = rooms.write().await;
            let empty = rooms_w
                .get(rid)
                .map(|tx| tx.receiver_count() == 0)
                .unwrap_or(false);
            if empty {
                rooms_w.remove(rid);
                log::info!("Room {rid:?} removed (empty)");
            }
            let room_count = rooms_w.len();
            drop(rooms_w);

            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = room_count;
        } else {
            stats.write().await.active_connections -= 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn test_relay_creation() {
        let relay = SyncRelay::with_defaults();
        assert_eq!(relay.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = SyncRelay::with_defaults();
        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.active_rooms, 0);
    }
}

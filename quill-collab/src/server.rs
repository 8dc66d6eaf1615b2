//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (documentId) ── Document replica ── BroadcastGroup
//! Client B ──┘          │                                      │
//!                       ├── AwarenessStore (cached presence)   │
//!                       └── SnapshotStore (on last leave)      │
//!                                         ┌────────────────────┼───────────┐
//!                                         ▼                    ▼           ▼
//!                                      Client A            Client B    Client C
//! ```
//!
//! Peers connect to `ws://host:port/{documentId}`. On connect the relay sends
//! its state vector (sync step 1) and the cached awareness of everyone in the
//! room. Updates are merged into the room replica and fanned out to the other
//! peers; a peer that falls behind the broadcast buffer is disconnected and
//! catches up through the handshake when it reconnects.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use quill_core::Document;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::awareness::{now_millis, AwarenessConfig, AwarenessFields, AwarenessStore, UserInfo};
use crate::broadcast::{PeerInfo, Room, RoomManager};
use crate::protocol::{AwarenessPayload, MessageKind, ProtocolError, SyncMessage};
use crate::storage::{RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Expiry of cached awareness entries
    pub awareness: AwarenessConfig,
    /// How often cached awareness is swept
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            awareness: AwarenessConfig::default(),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            awareness: AwarenessConfig::for_testing(),
            sweep_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub merged_updates: u64,
    pub persisted_snapshots: u64,
}

/// Authoritative state of one room.
pub struct RoomState {
    pub doc: Document,
    pub awareness: AwarenessStore,
}

impl RoomState {
    fn load(document_id: &str, store: Option<&dyn SnapshotStore>, awareness: AwarenessConfig) -> Self {
        let replica = Uuid::new_v4();
        let doc = match store.map(|s| s.load_latest(document_id)) {
            Some(Ok(Some(snapshot))) => match Document::import_snapshot(replica, &snapshot.bytes) {
                Ok(doc) => {
                    info!("Loaded {} revision {}", document_id, snapshot.revision);
                    doc
                }
                Err(e) => {
                    error!("Discarding unreadable snapshot of {}: {}", document_id, e);
                    Document::new(replica)
                }
            },
            Some(Err(e)) => {
                error!("Failed to load {}: {}", document_id, e);
                Document::new(replica)
            }
            Some(Ok(None)) | None => Document::new(replica),
        };
        // The relay has no presence of its own; its local entry is never sent.
        let relay = UserInfo::new(Uuid::nil(), "relay", "#000000");
        Self {
            doc,
            awareness: AwarenessStore::new(Uuid::nil(), AwarenessFields::new(relay), awareness),
        }
    }

    fn persist(&self, document_id: &str, store: &dyn SnapshotStore) -> Result<u64, StoreError> {
        let bytes = self
            .doc
            .export_snapshot()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let revision = store.next_revision(document_id)?;
        store.save(document_id, revision, &bytes)?;
        Ok(revision)
    }
}

struct Shared {
    config: ServerConfig,
    rooms: RoomManager<RoomState>,
    stats: RwLock<ServerStats>,
    store: Option<Arc<dyn SnapshotStore>>,
}

/// The relay server. Clones share the same rooms.
#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    /// In-memory relay: rooms are lost when their last peer leaves.
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Relay that saves each room to `store` when its last peer leaves.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self::build(config, Some(store))
    }

    /// Relay backed by a RocksDB snapshot store.
    pub fn with_rocks(config: ServerConfig, store_config: StoreConfig) -> Result<Self, StoreError> {
        let store = RocksSnapshotStore::open(store_config)?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    fn build(config: ServerConfig, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity, config.max_peers_per_room);
        Self {
            shared: Arc::new(Shared {
                config,
                rooms,
                stats: RwLock::new(ServerStats::default()),
                store,
            }),
        }
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let sweeper = tokio::spawn(Self::sweep_loop(Arc::downgrade(&self.shared)));
        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {}", addr);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }

    /// Expire cached awareness until the server is dropped.
    async fn sweep_loop(shared: Weak<Shared>) {
        let Some(period) = shared.upgrade().map(|s| s.config.sweep_interval) else {
            return;
        };
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let Some(server) = shared.upgrade() else {
                return;
            };
            for document_id in server.rooms.active_documents().await {
                if let Some(room) = server.rooms.get(&document_id).await {
                    let removed = room.state.write().await.awareness.sweep_expired(Instant::now());
                    if !removed.is_empty() {
                        debug!("Expired {} awareness entries in {}", removed.len(), document_id);
                    }
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), BoxError> {
        let mut document_id = String::new();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            let id = req.uri().path().trim_start_matches('/');
            if id.is_empty() {
                let mut err = ErrorResponse::new(Some("missing document id".to_string()));
                *err.status_mut() = StatusCode::BAD_REQUEST;
                return Err(err);
            }
            document_id = id.to_string();
            Ok(resp)
        })
        .await?;

        let peer = PeerInfo::new(Some(addr));
        let connection_id = peer.connection_id;
        let store = shared.store.clone();
        let awareness_config = shared.config.awareness.clone();
        let joined = shared
            .rooms
            .join(&document_id, peer, || {
                RoomState::load(&document_id, store.as_deref(), awareness_config)
            })
            .await;
        let Some((room, broadcast_rx)) = joined else {
            warn!("Room {} is full, rejecting {}", document_id, addr);
            let mut ws = ws;
            let _ = ws.close(None).await;
            return Ok(());
        };
        info!("Peer {} joined {}", addr, document_id);

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = shared.rooms.room_count().await;
        }

        let mut client_id = None;
        let result = Self::serve_peer(ws, broadcast_rx, &shared, &room, connection_id, &document_id, &mut client_id).await;

        // Tell the room the client is gone, then flush the room if it emptied.
        if let Some(id) = client_id {
            let leave = {
                let mut state = room.state.write().await;
                let last = state.awareness.get(&id).map_or(0, |e| e.timestamp);
                state.awareness.remove(id);
                AwarenessPayload::Leave {
                    client_id: id,
                    timestamp: now_millis().max(last + 1),
                }
            };
            match SyncMessage::awareness(Uuid::nil(), &document_id, &leave) {
                Ok(msg) => {
                    let _ = room.broadcast.broadcast(connection_id, &msg);
                }
                Err(e) => error!("Failed to encode leave for {}: {}", id, e),
            }
        }
        drop(room);

        let mut persisted = false;
        let store = shared.store.clone();
        shared
            .rooms
            .leave(&document_id, &connection_id, |state| {
                let Some(store) = store.as_deref() else { return };
                match state.persist(&document_id, store) {
                    Ok(revision) => {
                        info!("Persisted {} revision {} (room closing)", document_id, revision);
                        persisted = true;
                    }
                    Err(e) => error!("Failed to persist {}: {}", document_id, e),
                }
            })
            .await;
        info!("Peer {} left {}", addr, document_id);

        {
            let mut s = shared.stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = shared.rooms.room_count().await;
            if persisted {
                s.persisted_snapshots += 1;
            }
        }

        result
    }

    async fn serve_peer(
        ws: WebSocketStream<TcpStream>,
        mut broadcast_rx: tokio::sync::broadcast::Receiver<Arc<crate::broadcast::Outgoing>>,
        shared: &Shared,
        room: &Room<RoomState>,
        connection_id: Uuid,
        document_id: &str,
        client_id: &mut Option<Uuid>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();

        // Open the handshake and replay cached presence.
        let (state_vector, cached) = {
            let state = room.state.read().await;
            (state.doc.state_vector().encode()?, state.awareness.remote_payloads())
        };
        let step1 = SyncMessage::sync_step1(Uuid::nil(), document_id, state_vector);
        ws_sender.send(Message::Binary(step1.encode()?.into())).await?;
        for payload in &cached {
            let msg = SyncMessage::awareness(Uuid::nil(), document_id, payload)?;
            ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
        }

        loop {
            tokio::select! {
                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        let msg = match SyncMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("Failed to decode message in {}: {}", document_id, e);
                                continue;
                            }
                        };
                        if let Err(e) = msg.validate(document_id) {
                            warn!("Closing connection in {}: {}", document_id, e);
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                        if msg.sender != Uuid::nil() {
                            client_id.get_or_insert(msg.sender);
                        }
                        match Self::handle_message(shared, room, connection_id, document_id, &msg).await {
                            Ok(Some(reply)) => {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Dropping {:?} in {}: {}", msg.kind, document_id, e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection closed in {}", document_id);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket error in {}: {}", document_id, e);
                        return Ok(());
                    }
                },

                frame = broadcast_rx.recv() => match frame {
                    Ok(frame) => {
                        if frame.origin == connection_id {
                            continue;
                        }
                        ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Peer in {} lagged by {} messages, disconnecting", document_id, n);
                        room.broadcast.record_dropped(n);
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Apply one message to the room. Returns a direct reply, if any.
    async fn handle_message(
        shared: &Shared,
        room: &Room<RoomState>,
        connection_id: Uuid,
        document_id: &str,
        msg: &SyncMessage,
    ) -> Result<Option<SyncMessage>, ProtocolError> {
        match msg.kind {
            MessageKind::SyncStep1 => {
                let remote = msg.state_vector()?;
                let missing = room.state.read().await.doc.diff(&remote);
                debug!("Answering step 1 in {} with {} ops", document_id, missing.ops.len());
                Ok(Some(SyncMessage::sync_step2(Uuid::nil(), document_id, missing.encode()?)))
            }
            MessageKind::SyncStep2 | MessageKind::SyncUpdate => {
                let update = msg.sync_update()?;
                if update.is_empty() {
                    return Ok(None);
                }
                let delta = room.state.write().await.doc.merge_remote(&update);
                trace!(
                    "Merged {} ops from {} into {} ({} edits)",
                    update.ops.len(),
                    msg.sender,
                    document_id,
                    delta.edits.len()
                );
                shared.stats.write().await.merged_updates += 1;
                let forward = SyncMessage::update(msg.sender, document_id, msg.payload.clone());
                room.broadcast.broadcast(connection_id, &forward)?;
                Ok(None)
            }
            MessageKind::AwarenessUpdate => {
                let payload = msg.awareness_payload()?;
                let accepted = room.state.write().await.awareness.apply_payload(payload, Instant::now());
                if accepted {
                    room.broadcast.broadcast(connection_id, msg)?;
                }
                Ok(None)
            }
            MessageKind::Ping => Ok(Some(SyncMessage::pong(Uuid::nil(), document_id, msg.nonce()?))),
            MessageKind::Pong => Ok(None),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<dyn SnapshotStore>> {
        self.shared.store.as_ref()
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.room_count().await
    }

    /// Text of the room replica, if the room is open.
    pub async fn document_text(&self, document_id: &str) -> Option<String> {
        let room = self.shared.rooms.get(document_id).await?;
        let text = room.state.read().await.doc.text();
        Some(text)
    }

    /// Number of clients with cached awareness in a room.
    pub async fn awareness_count(&self, document_id: &str) -> usize {
        match self.shared.rooms.get(document_id).await {
            Some(room) => room.state.read().await.awareness.remote_count(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySnapshotStore;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.awareness.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(server.room_count().await, 0);
        assert!(server.store().is_none());
    }

    #[test]
    fn test_room_state_loads_saved_snapshot() {
        let store = MemorySnapshotStore::new();
        let doc = Document::seeded(Uuid::new_v4(), "saved text");
        store.save("a.rs", 1, &doc.export_snapshot().unwrap()).unwrap();

        let state = RoomState::load("a.rs", Some(&store), AwarenessConfig::for_testing());
        assert_eq!(state.doc.text(), "saved text");

        let revision = state.persist("a.rs", &store).unwrap();
        assert_eq!(revision, 2);
    }

    #[test]
    fn test_room_state_survives_corrupt_snapshot() {
        let store = MemorySnapshotStore::new();
        store.save("a.rs", 1, b"not a snapshot").unwrap();
        let state = RoomState::load("a.rs", Some(&store), AwarenessConfig::for_testing());
        assert!(state.doc.is_empty());
    }
}

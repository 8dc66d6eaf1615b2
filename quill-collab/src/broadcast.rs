//! Per-document fan-out.
//!
//! Every room shares one tokio broadcast channel. A frame published by one
//! connection reaches every subscriber; receivers skip frames they published
//! themselves. Each receiver buffers up to `capacity` frames before a slow
//! peer starts lagging.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// One connected socket in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Relay-assigned id of the connection
    pub connection_id: Uuid,
    pub addr: Option<SocketAddr>,
}

impl PeerInfo {
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            addr,
        }
    }
}

/// An encoded frame plus the connection that published it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub origin: Uuid,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Fan-out for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outgoing>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and subscribe it to the room.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Outgoing>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.connection_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(connection_id)
    }

    /// Encode `msg` once and publish it on behalf of `origin`.
    ///
    /// Returns the number of subscribers, the origin included.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(Outgoing { origin, bytes })))
    }

    /// Publish a pre-encoded frame.
    pub fn broadcast_raw(&self, frame: Arc<Outgoing>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A document room: fan-out plus whatever state the owner keeps per room.
pub struct Room<S> {
    pub broadcast: BroadcastGroup,
    pub state: RwLock<S>,
}

/// Maps document ids to rooms. Messages never cross rooms.
///
/// Joining and leaving go through the manager's write lock, so a room that is
/// being torn down is never handed to a new peer.
pub struct RoomManager<S> {
    rooms: RwLock<HashMap<String, Arc<Room<S>>>>,
    capacity: usize,
    max_peers: usize,
}

impl<S> RoomManager<S> {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    /// Add a peer to the room of `document_id`, creating the room with
    /// `init` if needed. Returns `None` when the room is full.
    pub async fn join(
        &self,
        document_id: &str,
        info: PeerInfo,
        init: impl FnOnce() -> S,
    ) -> Option<(Arc<Room<S>>, broadcast::Receiver<Arc<Outgoing>>)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(document_id.to_string())
            .or_insert_with(|| {
                Arc::new(Room {
                    broadcast: BroadcastGroup::new(self.capacity),
                    state: RwLock::new(init()),
                })
            })
            .clone();
        if room.broadcast.peer_count().await >= self.max_peers {
            return None;
        }
        let rx = room.broadcast.add_peer(info).await;
        Some((room, rx))
    }

    /// Remove a peer. When the room becomes empty `on_empty` sees its final
    /// state and the room is dropped, both under the manager lock.
    pub async fn leave(&self, document_id: &str, connection_id: &Uuid, on_empty: impl FnOnce(&S)) -> Option<PeerInfo> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(document_id)?.clone();
        let info = room.broadcast.remove_peer(connection_id).await;
        if room.broadcast.peer_count().await == 0 {
            {
                let state = room.state.read().await;
                on_empty(&state);
            }
            rooms.remove(document_id);
        }
        info
    }

    pub async fn get(&self, document_id: &str) -> Option<Arc<Room<S>>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new(None);
        let id = peer.connection_id;

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        group.remove_peer(&id).await;
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_carries_origin() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new(None);
        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(PeerInfo::new(None)).await;

        let msg = SyncMessage::update(Uuid::new_v4(), "doc", vec![1, 2, 3]);
        assert_eq!(group.broadcast(alice.connection_id, &msg).unwrap(), 2);

        for rx in [&mut rx1, &mut rx2] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.origin, alice.connection_id);
            assert_eq!(SyncMessage::decode(&frame.bytes).unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_peer(PeerInfo::new(None)).await;
        group.broadcast_raw(Arc::new(Outgoing { origin: Uuid::nil(), bytes: vec![1] }));
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_join_reuses_room_and_runs_init_once() {
        let manager: RoomManager<u32> = RoomManager::new(16, 10);
        let (room1, _rx1) = manager.join("a.rs", PeerInfo::new(None), || 7).await.unwrap();
        let (room2, _rx2) = manager.join("a.rs", PeerInfo::new(None), || 99).await.unwrap();

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(*room2.state.read().await, 7);
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let manager: RoomManager<()> = RoomManager::new(16, 10);
        let alice = PeerInfo::new(None);
        let (room_a, _rx_a) = manager.join("a.rs", alice.clone(), || ()).await.unwrap();
        let (_room_b, mut rx_b) = manager.join("b.rs", PeerInfo::new(None), || ()).await.unwrap();

        room_a
            .broadcast
            .broadcast(alice.connection_id, &SyncMessage::ping(Uuid::nil(), "a.rs", 1))
            .unwrap();
        assert!(rx_b.try_recv().is_err());
        assert_eq!(manager.active_documents().await, vec!["a.rs".to_string(), "b.rs".to_string()]);
    }

    #[tokio::test]
    async fn test_leave_runs_on_empty_once() {
        let manager: RoomManager<&'static str> = RoomManager::new(16, 10);
        let alice = PeerInfo::new(None);
        let bob = PeerInfo::new(None);
        let _a = manager.join("a.rs", alice.clone(), || "final").await.unwrap();
        let _b = manager.join("a.rs", bob.clone(), || "unused").await.unwrap();

        let mut flushed = Vec::new();
        manager.leave("a.rs", &alice.connection_id, |s| flushed.push(*s)).await;
        assert!(flushed.is_empty());
        assert_eq!(manager.room_count().await, 1);

        let left = manager.leave("a.rs", &bob.connection_id, |s| flushed.push(*s)).await;
        assert_eq!(left, Some(bob));
        assert_eq!(flushed, vec!["final"]);
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_room_rejects_join() {
        let manager: RoomManager<()> = RoomManager::new(16, 1);
        let _first = manager.join("a.rs", PeerInfo::new(None), || ()).await.unwrap();
        assert!(manager.join("a.rs", PeerInfo::new(None), || ()).await.is_none());
    }
}

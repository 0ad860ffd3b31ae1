//! Rooms and the routing-context pool
//!
//! A `Room` pairs a peer map with one lazily created routing context. The
//! registry serializes creation so concurrent joins to a brand-new room id
//! allocate exactly one routing context, and reaps a room synchronously the
//! moment its peer map empties. Peer insertion happens under the registry's
//! entry guard, which is what keeps a concurrent reap from removing a room
//! a join is inserting into.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::engine::{default_codec_set, MediaEngine, RouterHandle};
use crate::error::Result;
use crate::events::ServerEvent;
use crate::peer::PeerSession;
use crate::quality::QualityTier;
use crate::types::{PeerId, RoomId};

/// Identity of a peer already in a room, as reported to a joiner
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
}

pub struct Room {
    pub id: RoomId,
    router: OnceCell<Arc<dyn RouterHandle>>,
    peers: parking_lot::RwLock<HashMap<PeerId, Arc<PeerSession>>>,
    tier: parking_lot::Mutex<QualityTier>,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            router: OnceCell::new(),
            peers: parking_lot::RwLock::new(HashMap::new()),
            tier: parking_lot::Mutex::new(QualityTier::Medium),
        }
    }

    /// The room's routing context, creating it through the engine on first
    /// call. Concurrent callers are serialized; exactly one engine call is
    /// made per room.
    pub async fn router_or_init(
        &self,
        engine: &Arc<dyn MediaEngine>,
    ) -> Result<Arc<dyn RouterHandle>> {
        let router = self
            .router
            .get_or_try_init(|| async { engine.create_router(&default_codec_set()).await })
            .await?;
        Ok(Arc::clone(router))
    }

    #[must_use]
    pub fn router(&self) -> Option<Arc<dyn RouterHandle>> {
        self.router.get().cloned()
    }

    fn insert_peer(&self, peer: Arc<PeerSession>) -> Vec<PeerInfo> {
        let mut peers = self.peers.write();
        let existing = peers
            .values()
            .map(|p| PeerInfo {
                id: p.id.clone(),
                name: p.name(),
            })
            .collect();
        peers.insert(peer.id.clone(), peer);
        existing
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.write().remove(peer_id).is_some()
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Snapshot of the room's sessions.
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<PeerSession>> {
        self.peers.read().values().cloned().collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Deliver an event to every session in the room except `except`.
    /// Per-recipient failures are absorbed inside `PeerSession::notify`.
    pub fn broadcast(&self, event: &ServerEvent, except: Option<&PeerId>) {
        for peer in self.peers() {
            if Some(&peer.id) == except {
                continue;
            }
            peer.notify(event.clone());
        }
    }

    #[must_use]
    pub fn current_tier(&self) -> QualityTier {
        *self.tier.lock()
    }

    pub fn set_tier(&self, tier: QualityTier) {
        *self.tier.lock() = tier;
    }
}

/// Process-wide room table
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<Room>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Get-or-create the room and register the session in it, atomically
    /// with respect to empty-room reaping. Returns the room and the peers
    /// that were already in it.
    pub fn join_insert(
        &self,
        room_id: &RoomId,
        peer: Arc<PeerSession>,
    ) -> (Arc<Room>, Vec<PeerInfo>) {
        let entry = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                debug!(room_id = %room_id, "creating room");
                Arc::new(Room::new(room_id.clone()))
            });
        let room = Arc::clone(entry.value());
        let existing = room.insert_peer(peer);
        drop(entry);
        (room, existing)
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    /// Remove the room if its peer map is empty. The emptiness check runs
    /// under the same shard lock joins insert under, so a join and a reap
    /// cannot interleave on one room.
    pub fn reap_if_empty(&self, room_id: &RoomId) {
        let removed = self.rooms.remove_if(room_id, |_, room| room.is_empty());
        if removed.is_some() {
            info!(room_id = %room_id, "removed empty room");
        }
    }

    /// Snapshot of all active rooms.
    #[must_use]
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackEngine;

    fn session(id: &str) -> Arc<PeerSession> {
        let (session, _rx) = PeerSession::new(PeerId::from(id));
        session.set_name(id);
        // The receiver is dropped; notify() tolerates that.
        session
    }

    #[test]
    fn test_join_insert_reports_existing_peers() {
        let registry = RoomRegistry::new();
        let room_id = RoomId::from("r1");

        let (room_a, existing_a) = registry.join_insert(&room_id, session("alice"));
        assert!(existing_a.is_empty());

        let (room_b, existing_b) = registry.join_insert(&room_id, session("bob"));
        assert!(Arc::ptr_eq(&room_a, &room_b));
        assert_eq!(existing_b.len(), 1);
        assert_eq!(existing_b[0].id, PeerId::from("alice"));
        assert_eq!(room_b.peer_count(), 2);
    }

    #[test]
    fn test_room_exists_iff_nonempty() {
        let registry = RoomRegistry::new();
        let room_id = RoomId::from("r1");

        let (_, _) = registry.join_insert(&room_id, session("alice"));
        assert_eq!(registry.len(), 1);

        // Non-empty room survives a reap attempt.
        registry.reap_if_empty(&room_id);
        assert_eq!(registry.len(), 1);

        let room = registry.get(&room_id).unwrap();
        room.remove_peer(&PeerId::from("alice"));
        registry.reap_if_empty(&room_id);
        assert_eq!(registry.len(), 0);
        assert!(registry.get(&room_id).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_joins_create_one_router() {
        let registry = Arc::new(RoomRegistry::new());
        let loopback = Arc::new(LoopbackEngine::new());
        let engine: Arc<dyn MediaEngine> = loopback.clone();
        let room_id = RoomId::from("r1");

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            let engine = Arc::clone(&engine);
            let room_id = room_id.clone();
            handles.push(tokio::spawn(async move {
                let (room, _) = registry.join_insert(&room_id, session(&format!("peer{i}")));
                room.router_or_init(&engine).await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(loopback.routers_created(), 1);
        assert_eq!(registry.get(&room_id).unwrap().peer_count(), 8);
    }
}

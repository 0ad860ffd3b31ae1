//! Media-session orchestration
//!
//! `SfuManager` is the facade the signaling gateway drives: it tracks every
//! attached connection, runs the join/leave lifecycle against the room
//! registry, owns the room-scoped broadcast primitive, and relays the
//! adjacent non-media messages (chat, hand raising, screen-share presence,
//! moderator mute requests). Transport and producer/consumer operations
//! live in the `transport` and `exchange` modules as further impl blocks.
//!
//! Teardown is a single deterministic walk of the ownership tree
//! (room → session → transports/producers/consumers): producers cascade to
//! every other session's consumers bound to them, each affected owner gets
//! exactly one `consumerClosed`, and the room is reaped the moment it
//! empties. The walk is idempotent and safe to run for a connection whose
//! join never completed.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::ServerEvent;
use crate::engine::MediaEngine;
use crate::peer::PeerSession;
use crate::quality::{self, QualityTier};
use crate::room::{PeerInfo, Room, RoomRegistry};
use crate::types::{PeerId, ProducerId, RoomId};

/// Reply to a successful `join`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSummary {
    pub room_id: RoomId,
    /// Receive-capabilities descriptor of the room's routing context
    pub rtp_capabilities: Value,
    pub existing_peers: Vec<PeerInfo>,
}

/// One row of the active-rooms listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: RoomId,
    pub peer_count: usize,
    pub tier: QualityTier,
}

pub struct SfuManager {
    engine: Arc<dyn MediaEngine>,
    config: Arc<Config>,
    /// Every attached signaling connection, joined or not
    connections: DashMap<PeerId, Arc<PeerSession>>,
    rooms: RoomRegistry,
}

impl SfuManager {
    /// Create the manager and start its quality control loop.
    pub fn new(engine: Arc<dyn MediaEngine>, config: Config) -> Arc<Self> {
        let manager = Arc::new(Self {
            engine,
            config: Arc::new(config),
            connections: DashMap::new(),
            rooms: RoomRegistry::new(),
        });

        info!(
            quality_interval_secs = manager.config.quality.interval_secs,
            "SFU manager initialized"
        );

        quality::spawn(Arc::clone(&manager));

        manager
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn registry(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Register a new signaling connection. The returned receiver is the
    /// connection's outbound event stream.
    pub fn attach_peer(&self) -> (PeerId, mpsc::UnboundedReceiver<ServerEvent>) {
        let peer_id = PeerId::generate();
        let (session, events_rx) = PeerSession::new(peer_id.clone());
        self.connections.insert(peer_id.clone(), session);
        debug!(peer_id = %peer_id, connections = self.connections.len(), "peer attached");
        (peer_id, events_rx)
    }

    pub fn session(&self, peer_id: &PeerId) -> Result<Arc<PeerSession>> {
        self.connections
            .get(peer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::NotFound(format!("peer {peer_id} not found")))
    }

    /// The room the session has joined. An un-joined session is a protocol
    /// violation for every operation that calls this.
    pub(crate) fn joined_room(&self, session: &PeerSession) -> Result<Arc<Room>> {
        let room_id = session
            .room_id()
            .ok_or_else(|| Error::ProtocolViolation("not in a room".to_string()))?;
        self.rooms
            .get(&room_id)
            .ok_or_else(|| Error::NotFound(format!("room {room_id} not found")))
    }

    /// Join a room: registers the session under the room, initializes the
    /// room's routing context if this is the first join, announces the peer
    /// to the rest of the room, and reports the receive capabilities plus
    /// who was already there.
    pub async fn join(&self, peer_id: &PeerId, room_id: RoomId, name: String) -> Result<JoinSummary> {
        let session = self.session(peer_id)?;
        session.begin_join(room_id.clone())?;
        session.set_name(name.clone());

        let (room, existing_peers) = self.rooms.join_insert(&room_id, Arc::clone(&session));

        match room.router_or_init(&self.engine).await {
            Ok(router) => {
                info!(
                    peer_id = %peer_id,
                    room_id = %room_id,
                    name = %name,
                    peer_count = room.peer_count(),
                    "peer joined room"
                );
                room.broadcast(
                    &ServerEvent::PeerJoined {
                        peer_id: peer_id.clone(),
                        name,
                    },
                    Some(peer_id),
                );
                Ok(JoinSummary {
                    room_id,
                    rtp_capabilities: router.rtp_capabilities(),
                    existing_peers,
                })
            }
            Err(e) => {
                room.remove_peer(peer_id);
                self.rooms.reap_if_empty(&room_id);
                session.revert_join();
                Err(e)
            }
        }
    }

    /// Explicit leave. The connection stays attached but the session is
    /// terminal; a further leave or a later disconnect is a no-op.
    pub async fn leave(&self, peer_id: &PeerId) -> Result<()> {
        let session = self.session(peer_id)?;
        self.teardown(session).await;
        Ok(())
    }

    /// Transport-level disconnect. Runs unconditionally and is safe to call
    /// for unknown ids, connections that never joined, and connections that
    /// already left.
    pub async fn disconnect(&self, peer_id: &PeerId) {
        let Some((_, session)) = self.connections.remove(peer_id) else {
            return;
        };
        self.teardown(session).await;
    }

    /// Deterministic cascade over the session's ownership tree.
    async fn teardown(&self, session: Arc<PeerSession>) {
        let Some(room_id) = session.close_state() else {
            return;
        };
        let room = room_id.as_ref().and_then(|id| self.rooms.get(id));

        if let Some(room) = &room {
            if room.remove_peer(&session.id) {
                info!(peer_id = %session.id, room_id = %room.id, "peer left room");
                room.broadcast(
                    &ServerEvent::PeerLeft {
                        peer_id: session.id.clone(),
                        name: session.name(),
                    },
                    None,
                );
            }
        }

        if let Some(drained) = session.drain_resources() {
            for producer in &drained.producers {
                if let Err(e) = producer.close().await {
                    warn!(peer_id = %session.id, error = %e, "failed to close producer");
                }
                if let Some(room) = &room {
                    self.cascade_producer_close(room, &producer.id()).await;
                }
            }
            for slot in &drained.consumers {
                if let Err(e) = slot.handle.close().await {
                    warn!(peer_id = %session.id, error = %e, "failed to close consumer");
                }
            }
            for transport in &drained.transports {
                if let Err(e) = transport.close().await {
                    warn!(peer_id = %session.id, error = %e, "failed to close transport");
                }
            }
        }

        if let Some(room) = &room {
            self.rooms.reap_if_empty(&room.id);
        }
    }

    /// Close every consumer in the room bound to the named producer and
    /// tell each owner, once per consumer. The owners did not ask for this
    /// closure; it is server-driven.
    pub(crate) async fn cascade_producer_close(&self, room: &Room, producer_id: &ProducerId) {
        for other in room.peers() {
            for (consumer_id, slot) in other.take_consumers_of(producer_id) {
                if let Err(e) = slot.handle.close().await {
                    warn!(consumer_id = %consumer_id, error = %e, "failed to close consumer");
                }
                other.notify(ServerEvent::ConsumerClosed { consumer_id });
            }
        }
    }

    /// Relay a chat message to the rest of the room.
    pub fn chat(&self, peer_id: &PeerId, message: String) -> Result<()> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        room.broadcast(
            &ServerEvent::ChatMessage {
                peer_id: peer_id.clone(),
                name: session.name(),
                message,
                timestamp: Utc::now().to_rfc3339(),
            },
            Some(peer_id),
        );
        Ok(())
    }

    pub fn raise_hand(&self, peer_id: &PeerId) -> Result<()> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        room.broadcast(
            &ServerEvent::HandRaised {
                peer_id: peer_id.clone(),
                name: session.name(),
            },
            Some(peer_id),
        );
        Ok(())
    }

    pub fn lower_hand(&self, peer_id: &PeerId) -> Result<()> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        room.broadcast(
            &ServerEvent::HandLowered {
                peer_id: peer_id.clone(),
                name: session.name(),
            },
            Some(peer_id),
        );
        Ok(())
    }

    pub fn set_screen_sharing(&self, peer_id: &PeerId, sharing: bool) -> Result<()> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        room.broadcast(
            &ServerEvent::ScreenSharing {
                peer_id: peer_id.clone(),
                sharing,
            },
            Some(peer_id),
        );
        Ok(())
    }

    /// Ask one specific room member to mute itself. Directed, not broadcast.
    pub fn mute_participant(&self, peer_id: &PeerId, target: &PeerId) -> Result<()> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        let target_session = room
            .peer(target)
            .ok_or_else(|| Error::NotFound(format!("peer {target} not found")))?;
        target_session.notify(ServerEvent::MuteRequest {
            requester_peer_id: peer_id.clone(),
        });
        Ok(())
    }

    /// Active rooms with their sizes and current tiers.
    #[must_use]
    pub fn room_summaries(&self) -> Vec<RoomSummary> {
        self.rooms
            .rooms()
            .into_iter()
            .map(|room| RoomSummary {
                id: room.id.clone(),
                peer_count: room.peer_count(),
                tier: room.current_tier(),
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackEngine;

    pub(crate) fn manager() -> (Arc<SfuManager>, Arc<LoopbackEngine>) {
        let loopback = Arc::new(LoopbackEngine::new());
        let engine: Arc<dyn MediaEngine> = Arc::clone(&loopback) as Arc<dyn MediaEngine>;
        (SfuManager::new(engine, Config::default()), loopback)
    }

    pub(crate) async fn join_peer(
        manager: &SfuManager,
        room: &str,
        name: &str,
    ) -> (PeerId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (peer_id, events_rx) = manager.attach_peer();
        manager
            .join(&peer_id, RoomId::from(room), name.to_string())
            .await
            .unwrap();
        (peer_id, events_rx)
    }

    pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_join_reports_capabilities_and_existing_peers() {
        let (manager, _) = manager();

        let (alice, mut alice_rx) = join_peer(&manager, "room1", "alice").await;

        let (bob, _) = manager.attach_peer();
        let summary = manager
            .join(&bob, RoomId::from("room1"), "bob".to_string())
            .await
            .unwrap();

        assert_eq!(summary.room_id, RoomId::from("room1"));
        assert!(summary.rtp_capabilities.get("codecs").is_some());
        assert_eq!(summary.existing_peers.len(), 1);
        assert_eq!(summary.existing_peers[0].id, alice);
        assert_eq!(summary.existing_peers[0].name, "alice");

        // Alice was told, bob was not told about himself.
        let events = drain(&mut alice_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::PeerJoined { peer_id, name }] if *peer_id == bob && name == "bob"
        ));
    }

    #[tokio::test]
    async fn test_double_join_is_rejected() {
        let (manager, _) = manager();
        let (alice, _rx) = join_peer(&manager, "room1", "alice").await;

        let err = manager
            .join(&alice, RoomId::from("room2"), "alice".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));

        // Only the first room exists.
        assert_eq!(manager.room_summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_room_exists_iff_peers_remain() {
        let (manager, _) = manager();
        let (alice, _a) = join_peer(&manager, "room1", "alice").await;
        let (bob, _b) = join_peer(&manager, "room1", "bob").await;
        assert_eq!(manager.room_summaries().len(), 1);

        manager.leave(&alice).await.unwrap();
        assert_eq!(manager.room_summaries().len(), 1);

        manager.leave(&bob).await.unwrap();
        assert!(manager.room_summaries().is_empty());
    }

    #[tokio::test]
    async fn test_leave_broadcasts_peer_left_and_is_idempotent() {
        let (manager, _) = manager();
        let (alice, mut alice_rx) = join_peer(&manager, "room1", "alice").await;
        let (bob, _b) = join_peer(&manager, "room1", "bob").await;
        drain(&mut alice_rx);

        manager.leave(&bob).await.unwrap();
        let events = drain(&mut alice_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::PeerLeft { peer_id, .. }] if *peer_id == bob
        ));

        // Leaving again and disconnecting afterwards are both no-ops.
        manager.leave(&bob).await.unwrap();
        manager.disconnect(&bob).await;
        assert!(drain(&mut alice_rx).is_empty());
        let _ = alice;
    }

    #[tokio::test]
    async fn test_disconnect_without_join_is_safe() {
        let (manager, _) = manager();
        let (peer_id, _rx) = manager.attach_peer();

        manager.disconnect(&peer_id).await;
        manager.disconnect(&peer_id).await;
        manager.disconnect(&PeerId::from("never-attached")).await;

        assert!(manager.room_summaries().is_empty());
        assert!(matches!(manager.session(&peer_id), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_chat_reaches_everyone_but_sender() {
        let (manager, _) = manager();
        let (alice, mut alice_rx) = join_peer(&manager, "room1", "alice").await;
        let (bob, mut bob_rx) = join_peer(&manager, "room1", "bob").await;
        drain(&mut alice_rx);

        manager.chat(&bob, "hello".to_string()).unwrap();

        let events = drain(&mut alice_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::ChatMessage { peer_id, name, message, .. }]
                if *peer_id == bob && name == "bob" && message == "hello"
        ));
        assert!(drain(&mut bob_rx).is_empty());
        let _ = alice;
    }

    #[tokio::test]
    async fn test_chat_requires_joined_room() {
        let (manager, _) = manager();
        let (peer_id, _rx) = manager.attach_peer();
        let err = manager.chat(&peer_id, "hi".to_string()).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_mute_request_is_directed() {
        let (manager, _) = manager();
        let (alice, mut alice_rx) = join_peer(&manager, "room1", "alice").await;
        let (bob, mut bob_rx) = join_peer(&manager, "room1", "bob").await;
        let (carol, mut carol_rx) = join_peer(&manager, "room1", "carol").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        manager.mute_participant(&alice, &bob).unwrap();

        let events = drain(&mut bob_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::MuteRequest { requester_peer_id }] if *requester_peer_id == alice
        ));
        assert!(drain(&mut carol_rx).is_empty());
        let _ = carol;
    }

    #[tokio::test]
    async fn test_hand_and_screen_share_events() {
        let (manager, _) = manager();
        let (alice, mut alice_rx) = join_peer(&manager, "room1", "alice").await;
        let (bob, _b) = join_peer(&manager, "room1", "bob").await;
        drain(&mut alice_rx);

        manager.raise_hand(&bob).unwrap();
        manager.lower_hand(&bob).unwrap();
        manager.set_screen_sharing(&bob, true).unwrap();

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ServerEvent::HandRaised { peer_id, .. } if *peer_id == bob));
        assert!(matches!(&events[1], ServerEvent::HandLowered { peer_id, .. } if *peer_id == bob));
        assert!(matches!(
            &events[2],
            ServerEvent::ScreenSharing { peer_id, sharing: true } if *peer_id == bob
        ));
        let _ = alice;
    }
}

//! Peer session state and lifecycle
//!
//! A `PeerSession` is created when a signaling connection attaches and owns
//! everything that connection allocates: its transports, producers and
//! consumers. The resource maps live behind a single mutex together with a
//! `closed` flag, which makes teardown mutually exclusive with concurrent
//! resource creation: an insert that loses the race against teardown is
//! rejected, and the caller closes the freshly created engine object itself.
//! Engine calls are never awaited while the lock is held.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{ConsumerHandle, ProducerHandle, TransportHandle};
use crate::error::{Error, Result};
use crate::events::ServerEvent;
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportDirection, TransportId};

/// Session lifecycle: `connected → joined → closed` (terminal).
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerState {
    Connected,
    Joined(RoomId),
    Closed,
}

struct TransportSlot {
    direction: TransportDirection,
    handle: Arc<dyn TransportHandle>,
}

/// A consumer plus the bookkeeping the viewing side needs: which producer it
/// is bound to and which remote peer owns that producer.
pub struct ConsumerSlot {
    pub handle: Arc<dyn ConsumerHandle>,
    pub producer_id: ProducerId,
    pub producer_peer_id: PeerId,
}

#[derive(Default)]
struct Resources {
    closed: bool,
    transports: HashMap<TransportId, TransportSlot>,
    producers: HashMap<ProducerId, Arc<dyn ProducerHandle>>,
    consumers: HashMap<ConsumerId, ConsumerSlot>,
}

/// Everything a teardown pass has to close, in cascade order.
pub struct DrainedResources {
    pub transports: Vec<Arc<dyn TransportHandle>>,
    pub producers: Vec<Arc<dyn ProducerHandle>>,
    pub consumers: Vec<ConsumerSlot>,
}

/// Per-connection session state
pub struct PeerSession {
    pub id: PeerId,
    name: RwLock<String>,
    state: Mutex<PeerState>,
    resources: Mutex<Resources>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl PeerSession {
    /// Create a session for a freshly attached connection. The returned
    /// receiver is the connection's outbound event stream.
    pub fn new(id: PeerId) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            name: RwLock::new(String::new()),
            state: Mutex::new(PeerState::Connected),
            resources: Mutex::new(Resources::default()),
            events,
        });
        (session, events_rx)
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Deliver an event to this session's connection. Delivery failures are
    /// isolated here so one slow or gone recipient never affects the rest of
    /// a broadcast.
    pub fn notify(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!(peer_id = %self.id, "event dropped, connection gone");
        }
    }

    /// Room this session has joined, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match &*self.state.lock() {
            PeerState::Joined(room_id) => Some(room_id.clone()),
            _ => None,
        }
    }

    /// Transition `connected → joined`. Joining twice, or joining a closed
    /// session, is a protocol violation.
    pub fn begin_join(&self, room_id: RoomId) -> Result<()> {
        let mut state = self.state.lock();
        match &*state {
            PeerState::Connected => {
                *state = PeerState::Joined(room_id);
                Ok(())
            }
            PeerState::Joined(current) => Err(Error::ProtocolViolation(format!(
                "already joined room {current}"
            ))),
            PeerState::Closed => Err(Error::ProtocolViolation("session closed".to_string())),
        }
    }

    /// Roll a failed join back to `connected` so the connection can retry.
    pub fn revert_join(&self) {
        let mut state = self.state.lock();
        if matches!(&*state, PeerState::Joined(_)) {
            *state = PeerState::Connected;
        }
    }

    /// Transition to the terminal state. Returns `None` when the session was
    /// already closed (teardown ran before), otherwise the room the session
    /// was in, if any.
    pub fn close_state(&self) -> Option<Option<RoomId>> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, PeerState::Closed) {
            PeerState::Closed => None,
            PeerState::Connected => Some(None),
            PeerState::Joined(room_id) => Some(Some(room_id)),
        }
    }

    /// Store a transport. At most one transport per direction may exist; a
    /// second request for a held direction is rejected rather than silently
    /// replacing the old transport.
    pub fn insert_transport(
        &self,
        direction: TransportDirection,
        handle: Arc<dyn TransportHandle>,
    ) -> Result<()> {
        let mut resources = self.resources.lock();
        if resources.closed {
            return Err(Error::NotFound(format!("peer {} not found", self.id)));
        }
        if resources
            .transports
            .values()
            .any(|slot| slot.direction == direction)
        {
            return Err(Error::ProtocolViolation(format!(
                "{direction} transport already exists"
            )));
        }
        resources
            .transports
            .insert(handle.id(), TransportSlot { direction, handle });
        Ok(())
    }

    /// Look up an owned transport. Ids are session-scoped; an id owned by a
    /// different session is indistinguishable from an unknown one.
    pub fn transport(&self, id: &TransportId) -> Result<Arc<dyn TransportHandle>> {
        self.resources
            .lock()
            .transports
            .get(id)
            .map(|slot| Arc::clone(&slot.handle))
            .ok_or_else(|| Error::NotFound(format!("transport {id} not found")))
    }

    /// Like [`transport`](Self::transport) but also asserts the direction.
    pub fn transport_for(
        &self,
        id: &TransportId,
        direction: TransportDirection,
    ) -> Result<Arc<dyn TransportHandle>> {
        let resources = self.resources.lock();
        let slot = resources
            .transports
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("transport {id} not found")))?;
        if slot.direction != direction {
            return Err(Error::ProtocolViolation(format!(
                "transport {id} is not a {direction} transport"
            )));
        }
        Ok(Arc::clone(&slot.handle))
    }

    /// The session's send transport, if one is open.
    #[must_use]
    pub fn send_transport(&self) -> Option<Arc<dyn TransportHandle>> {
        self.resources
            .lock()
            .transports
            .values()
            .find(|slot| slot.direction == TransportDirection::Send)
            .map(|slot| Arc::clone(&slot.handle))
    }

    pub fn insert_producer(&self, handle: Arc<dyn ProducerHandle>) -> Result<()> {
        let mut resources = self.resources.lock();
        if resources.closed {
            return Err(Error::NotFound(format!("peer {} not found", self.id)));
        }
        resources.producers.insert(handle.id(), handle);
        Ok(())
    }

    pub fn producer(&self, id: &ProducerId) -> Result<Arc<dyn ProducerHandle>> {
        self.resources
            .lock()
            .producers
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| Error::NotFound(format!("producer {id} not found")))
    }

    #[must_use]
    pub fn has_producer(&self, id: &ProducerId) -> bool {
        self.resources.lock().producers.contains_key(id)
    }

    pub fn remove_producer(&self, id: &ProducerId) -> Result<Arc<dyn ProducerHandle>> {
        self.resources
            .lock()
            .producers
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("producer {id} not found")))
    }

    pub fn insert_consumer(&self, id: ConsumerId, slot: ConsumerSlot) -> Result<()> {
        let mut resources = self.resources.lock();
        if resources.closed {
            return Err(Error::NotFound(format!("peer {} not found", self.id)));
        }
        resources.consumers.insert(id, slot);
        Ok(())
    }

    pub fn consumer(&self, id: &ConsumerId) -> Result<Arc<dyn ConsumerHandle>> {
        self.resources
            .lock()
            .consumers
            .get(id)
            .map(|slot| Arc::clone(&slot.handle))
            .ok_or_else(|| Error::NotFound(format!("consumer {id} not found")))
    }

    pub fn remove_consumer(&self, id: &ConsumerId) -> Option<ConsumerSlot> {
        self.resources.lock().consumers.remove(id)
    }

    /// Remove and return every consumer bound to the named producer. Used by
    /// the producer-close cascade walking other sessions in the room.
    pub fn take_consumers_of(&self, producer_id: &ProducerId) -> Vec<(ConsumerId, ConsumerSlot)> {
        let mut resources = self.resources.lock();
        let ids: Vec<ConsumerId> = resources
            .consumers
            .iter()
            .filter(|(_, slot)| &slot.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| resources.consumers.remove(&id).map(|slot| (id, slot)))
            .collect()
    }

    /// Mark the session's resources closed and hand everything back for the
    /// cascade. Returns `None` when a previous teardown already drained.
    pub fn drain_resources(&self) -> Option<DrainedResources> {
        let mut resources = self.resources.lock();
        if resources.closed {
            return None;
        }
        resources.closed = true;
        Some(DrainedResources {
            transports: resources
                .transports
                .drain()
                .map(|(_, slot)| slot.handle)
                .collect(),
            producers: resources.producers.drain().map(|(_, p)| p).collect(),
            consumers: resources.consumers.drain().map(|(_, slot)| slot).collect(),
        })
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        debug!(peer_id = %self.id, "peer session dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::engine::loopback::LoopbackEngine;
    use crate::engine::{default_codec_set, MediaEngine, TransportOptions};

    async fn transport_handle(engine: &LoopbackEngine) -> Arc<dyn TransportHandle> {
        let router = engine.create_router(&default_codec_set()).await.unwrap();
        router
            .create_transport(&TransportOptions::from(&TransportConfig::default()))
            .await
            .unwrap()
    }

    #[test]
    fn test_join_state_machine() {
        let (session, _rx) = PeerSession::new(PeerId::from("p1"));
        assert!(session.room_id().is_none());

        session.begin_join(RoomId::from("r1")).unwrap();
        assert_eq!(session.room_id(), Some(RoomId::from("r1")));

        // Second join is rejected.
        let err = session.begin_join(RoomId::from("r2")).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_close_state_is_idempotent() {
        let (session, _rx) = PeerSession::new(PeerId::from("p1"));
        session.begin_join(RoomId::from("r1")).unwrap();

        assert_eq!(session.close_state(), Some(Some(RoomId::from("r1"))));
        assert_eq!(session.close_state(), None);

        // Join after close stays rejected.
        assert!(session.begin_join(RoomId::from("r1")).is_err());
    }

    #[tokio::test]
    async fn test_one_transport_per_direction() {
        let engine = LoopbackEngine::new();
        let (session, _rx) = PeerSession::new(PeerId::from("p1"));

        let first = transport_handle(&engine).await;
        session
            .insert_transport(TransportDirection::Send, first)
            .unwrap();

        let second = transport_handle(&engine).await;
        let err = session
            .insert_transport(TransportDirection::Send, second)
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));

        // The other direction is still free.
        let receive = transport_handle(&engine).await;
        session
            .insert_transport(TransportDirection::Receive, receive)
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_after_drain_is_rejected() {
        let engine = LoopbackEngine::new();
        let (session, _rx) = PeerSession::new(PeerId::from("p1"));

        let drained = session.drain_resources().unwrap();
        assert!(drained.transports.is_empty());
        assert!(session.drain_resources().is_none());

        let late = transport_handle(&engine).await;
        let err = session
            .insert_transport(TransportDirection::Send, late)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transport_direction_check() {
        let engine = LoopbackEngine::new();
        let (session, _rx) = PeerSession::new(PeerId::from("p1"));

        let handle = transport_handle(&engine).await;
        let id = handle.id();
        session
            .insert_transport(TransportDirection::Send, handle)
            .unwrap();

        assert!(session.transport_for(&id, TransportDirection::Send).is_ok());
        let err = session
            .transport_for(&id, TransportDirection::Receive)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ProtocolViolation(_)));

        let unknown = TransportId::from("nope");
        assert!(matches!(
            session.transport(&unknown),
            Err(Error::NotFound(_))
        ));
    }
}

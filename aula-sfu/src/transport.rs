//! Transport lifecycle operations
//!
//! Creation delegates to the room's routing context with the configured
//! listen/announced address pair and bitrate bounds; the resulting handle is
//! stored under the requesting session only. An insert that loses the race
//! against session teardown closes the freshly created engine transport and
//! fails the request cleanly.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::engine::TransportOptions;
use crate::error::{Error, Result};
use crate::manager::SfuManager;
use crate::types::{PeerId, TransportDirection, TransportId};

/// Negotiation parameters handed back to the requesting client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

impl SfuManager {
    /// Allocate a transport of the given direction on the caller's room
    /// routing context.
    pub async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        let router = room
            .router()
            .ok_or_else(|| Error::Engine("routing context not initialized".to_string()))?;

        let options = TransportOptions::from(&self.config().transport);
        let handle = router.create_transport(&options).await?;
        let descriptor = TransportDescriptor {
            id: handle.id(),
            ice_parameters: handle.ice_parameters(),
            ice_candidates: handle.ice_candidates(),
            dtls_parameters: handle.dtls_parameters(),
        };

        if let Err(e) = session.insert_transport(direction, handle.clone()) {
            // Teardown won the race, or the direction is already taken.
            if let Err(close_err) = handle.close().await {
                warn!(
                    transport_id = %descriptor.id,
                    error = %close_err,
                    "failed to close orphaned transport"
                );
            }
            return Err(e);
        }

        info!(
            peer_id = %peer_id,
            transport_id = %descriptor.id,
            direction = %direction,
            "transport created"
        );
        Ok(descriptor)
    }

    /// Finalize DTLS role negotiation for an owned transport.
    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<()> {
        let session = self.session(peer_id)?;
        let transport = session.transport(transport_id)?;
        transport.connect(dtls_parameters).await?;
        info!(peer_id = %peer_id, transport_id = %transport_id, "transport connected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{join_peer, manager};
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_connect_transport() {
        let (manager, _) = manager();
        let (alice, _rx) = join_peer(&manager, "room1", "alice").await;

        let descriptor = manager
            .create_transport(&alice, TransportDirection::Send)
            .await
            .unwrap();
        assert!(descriptor.ice_parameters.get("usernameFragment").is_some());
        assert!(descriptor.ice_candidates.as_array().is_some());
        assert!(descriptor.dtls_parameters.get("fingerprints").is_some());

        manager
            .connect_transport(&alice, &descriptor.id, json!({ "role": "client" }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_transport_requires_join() {
        let (manager, _) = manager();
        let (peer_id, _rx) = manager.attach_peer();

        let err = manager
            .create_transport(&peer_id, TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_second_send_transport_rejected_and_closed() {
        let (manager, engine) = manager();
        let (alice, _rx) = join_peer(&manager, "room1", "alice").await;

        let first = manager
            .create_transport(&alice, TransportDirection::Send)
            .await
            .unwrap();
        let err = manager
            .create_transport(&alice, TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));

        // The rejected engine transport was closed; the first one survives.
        assert!(!engine.is_transport_closed(&first.id));
        let closed: Vec<_> = engine
            .transport_ids()
            .into_iter()
            .filter(|id| engine.is_transport_closed(id))
            .collect();
        assert_eq!(closed.len(), 1);

        // A receive transport is still allowed.
        manager
            .create_transport(&alice, TransportDirection::Receive)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_unknown_transport_fails() {
        let (manager, _) = manager();
        let (alice, _rx) = join_peer(&manager, "room1", "alice").await;

        let err = manager
            .connect_transport(&alice, &TransportId::from("nope"), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transports_are_session_scoped() {
        let (manager, _) = manager();
        let (alice, _a) = join_peer(&manager, "room1", "alice").await;
        let (bob, _b) = join_peer(&manager, "room1", "bob").await;

        let descriptor = manager
            .create_transport(&alice, TransportDirection::Send)
            .await
            .unwrap();

        // Bob cannot touch alice's transport, even within the same room.
        let err = manager
            .connect_transport(&bob, &descriptor.id, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_racing_teardown_fails_cleanly() {
        let (manager, engine) = manager();
        let (alice, _rx) = join_peer(&manager, "room1", "alice").await;

        // Simulate teardown winning the race between the engine call and the
        // session insert: resources are drained but the request is in flight.
        let session = manager.session(&alice).unwrap();
        session.drain_resources().unwrap();

        let err = manager
            .create_transport(&alice, TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // Nothing leaked: every engine transport ended up closed.
        assert!(engine
            .transport_ids()
            .iter()
            .all(|id| engine.is_transport_closed(id)));
    }
}

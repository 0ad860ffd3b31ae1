//! Producer/consumer exchange
//!
//! The core of the signaling protocol: publishing a stream onto a send
//! transport, subscribing another peer's stream onto a receive transport,
//! pause/resume propagation, and the close cascade. Consumers are created
//! paused so the receiving side has a deterministic window to finish wiring
//! playback before packets arrive; the client resumes explicitly.
//!
//! A consumer also records which remote peer owns its producer, so the
//! viewing side can group one peer's audio/video/screen streams together.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::events::ServerEvent;
use crate::manager::SfuManager;
use crate::peer::ConsumerSlot;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportDirection, TransportId};

/// Reply to a successful `consume`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeSummary {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
}

impl SfuManager {
    /// Publish a stream onto the caller's send transport and announce it to
    /// the rest of the room.
    pub async fn produce(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<ProducerId> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        let transport = session.transport_for(transport_id, TransportDirection::Send)?;

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();

        if let Err(e) = session.insert_producer(Arc::clone(&producer)) {
            if let Err(close_err) = producer.close().await {
                warn!(
                    producer_id = %producer_id,
                    error = %close_err,
                    "failed to close orphaned producer"
                );
            }
            return Err(e);
        }

        info!(
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "producer created"
        );
        room.broadcast(
            &ServerEvent::NewProducer {
                producer_id: producer_id.clone(),
                producer_peer_id: peer_id.clone(),
                kind,
                app_data,
            },
            Some(peer_id),
        );
        Ok(producer_id)
    }

    /// Subscribe the caller's receive transport to another peer's producer.
    /// Capability mismatch is a hard failure, never a silent downgrade. The
    /// consumer comes back paused.
    pub async fn consume(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
    ) -> Result<ConsumeSummary> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        let router = room
            .router()
            .ok_or_else(|| Error::Engine("routing context not initialized".to_string()))?;
        let transport = session.transport_for(transport_id, TransportDirection::Receive)?;

        let producing = room
            .peers()
            .into_iter()
            .find(|p| p.has_producer(producer_id))
            .ok_or_else(|| Error::NotFound(format!("producer {producer_id} not found")))?;

        if !router.can_consume(producer_id, &rtp_capabilities) {
            return Err(Error::CapabilityMismatch(format!(
                "receiver cannot consume producer {producer_id}"
            )));
        }

        let consumer = transport.consume(producer_id, rtp_capabilities).await?;
        let consumer_id = consumer.id();
        let summary = ConsumeSummary {
            id: consumer_id.clone(),
            producer_id: producer_id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        };

        if let Err(e) = session.insert_consumer(
            consumer_id.clone(),
            ConsumerSlot {
                handle: Arc::clone(&consumer),
                producer_id: producer_id.clone(),
                producer_peer_id: producing.id.clone(),
            },
        ) {
            if let Err(close_err) = consumer.close().await {
                warn!(
                    consumer_id = %consumer_id,
                    error = %close_err,
                    "failed to close orphaned consumer"
                );
            }
            return Err(e);
        }

        // The producer may have closed while the engine call was in flight,
        // in which case the cascade walked this session before the insert
        // landed. Re-check and undo rather than resurrect a dead consumer.
        if !producing.has_producer(producer_id) {
            if let Some(slot) = session.remove_consumer(&consumer_id) {
                if let Err(e) = slot.handle.close().await {
                    warn!(consumer_id = %consumer_id, error = %e, "failed to close consumer");
                }
            }
            return Err(Error::NotFound(format!("producer {producer_id} not found")));
        }

        info!(
            peer_id = %peer_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            producer_peer_id = %producing.id,
            "consumer created"
        );
        Ok(summary)
    }

    /// Let media flow to a consumer the caller finished wiring up.
    pub async fn resume_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<()> {
        let session = self.session(peer_id)?;
        let consumer = session.consumer(consumer_id)?;
        consumer.resume().await?;
        info!(peer_id = %peer_id, consumer_id = %consumer_id, "consumer resumed");
        Ok(())
    }

    pub async fn pause_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) -> Result<()> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        let producer = session.producer(producer_id)?;
        producer.pause().await?;
        room.broadcast(
            &ServerEvent::ProducerPaused {
                producer_id: producer_id.clone(),
                producer_peer_id: peer_id.clone(),
            },
            Some(peer_id),
        );
        Ok(())
    }

    pub async fn resume_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) -> Result<()> {
        let session = self.session(peer_id)?;
        let room = self.joined_room(&session)?;
        let producer = session.producer(producer_id)?;
        producer.resume().await?;
        room.broadcast(
            &ServerEvent::ProducerResumed {
                producer_id: producer_id.clone(),
                producer_peer_id: peer_id.clone(),
            },
            Some(peer_id),
        );
        Ok(())
    }

    /// Close an owned producer. Every consumer elsewhere bound to it is
    /// closed too, and each owner is told once per consumer.
    pub async fn close_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) -> Result<()> {
        let session = self.session(peer_id)?;
        let producer = session.remove_producer(producer_id)?;

        if let Err(e) = producer.close().await {
            warn!(producer_id = %producer_id, error = %e, "failed to close producer");
        }
        if let Ok(room) = self.joined_room(&session) {
            self.cascade_producer_close(&room, producer_id).await;
        }

        info!(peer_id = %peer_id, producer_id = %producer_id, "producer closed");
        Ok(())
    }
}

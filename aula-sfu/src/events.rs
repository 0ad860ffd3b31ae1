//! Server-to-client event surface
//!
//! Events are fanned out per room by the orchestrator and serialized as-is
//! by the signaling gateway. Room-scoped broadcasts always exclude the
//! originating peer; the originator learns its own state from the
//! correlated reply to its request.

use serde::Serialize;
use serde_json::Value;

use crate::quality::{QualityTier, VideoEnvelope};
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerEvent {
    PeerJoined {
        peer_id: PeerId,
        name: String,
    },
    PeerLeft {
        peer_id: PeerId,
        name: String,
    },
    NewProducer {
        producer_id: ProducerId,
        producer_peer_id: PeerId,
        kind: MediaKind,
        app_data: Value,
    },
    ProducerPaused {
        producer_id: ProducerId,
        producer_peer_id: PeerId,
    },
    ProducerResumed {
        producer_id: ProducerId,
        producer_peer_id: PeerId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
    },
    ChatMessage {
        peer_id: PeerId,
        name: String,
        message: String,
        timestamp: String,
    },
    HandRaised {
        peer_id: PeerId,
        name: String,
    },
    HandLowered {
        peer_id: PeerId,
        name: String,
    },
    ScreenSharing {
        peer_id: PeerId,
        sharing: bool,
    },
    /// Directed to a single peer, never broadcast
    MuteRequest {
        requester_peer_id: PeerId,
    },
    /// Room-wide capture envelope and bitrate ceiling for the new tier
    QualityChanged {
        tier: QualityTier,
        video: VideoEnvelope,
        max_bitrate: u32,
    },
}

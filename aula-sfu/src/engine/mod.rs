//! Media engine boundary
//!
//! The orchestrator never touches codecs, ICE, DTLS or RTP itself. All of
//! that lives behind the trait-object capability set in this module: a
//! routing context per room, direction-typed transports, and producer and
//! consumer handles. Negotiated parameter blobs (ICE/DTLS/RTP parameters,
//! receive capabilities) are opaque `serde_json::Value`s passed through to
//! clients untouched. Any engine exposing this capability set is
//! substitutable.

pub mod loopback;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

/// A single codec a routing context is created with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecSpec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: Value,
}

/// The fixed codec set every routing context is created with:
/// Opus for audio; VP8, VP9 and H.264 for video.
#[must_use]
pub fn default_codec_set() -> Vec<CodecSpec> {
    vec![
        CodecSpec {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: Value::Null,
        },
        CodecSpec {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({ "x-google-start-bitrate": 1000 }),
        },
        CodecSpec {
            kind: MediaKind::Video,
            mime_type: "video/VP9".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({ "profile-id": 2, "x-google-start-bitrate": 1000 }),
        },
        CodecSpec {
            kind: MediaKind::Video,
            mime_type: "video/h264".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({
                "packetization-mode": 1,
                "profile-level-id": "4d0032",
                "level-asymmetry-allowed": 1,
                "x-google-start-bitrate": 1000,
            }),
        },
    ]
}

/// Listen/bitrate parameters for transport allocation
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Local bind address
    pub listen_ip: String,
    /// Address announced to remote peers
    pub announced_ip: String,
    /// UDP preferred over TCP when both are viable
    pub prefer_udp: bool,
    pub initial_outgoing_bitrate: u32,
    pub minimum_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
}

impl From<&TransportConfig> for TransportOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            listen_ip: config.listen_ip.clone(),
            announced_ip: config.announced_ip.clone(),
            prefer_udp: true,
            initial_outgoing_bitrate: config.initial_outgoing_bitrate,
            minimum_outgoing_bitrate: config.minimum_outgoing_bitrate,
            max_incoming_bitrate: config.max_incoming_bitrate,
        }
    }
}

/// Raw transport statistics snapshot, as reported by the engine.
///
/// Counters are cumulative; the quality controller derives rates from the
/// delta between two consecutive snapshots.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransportStats {
    /// Round-trip time of the active candidate pair, milliseconds
    pub rtt_ms: f64,
    /// Cumulative packets sent on the outbound video stream
    pub packets_sent: u64,
    /// Cumulative packets reported lost on the outbound video stream
    pub packets_lost: u64,
    /// Cumulative bytes sent
    pub bytes_sent: u64,
    /// Engine clock at snapshot time, milliseconds
    pub timestamp_ms: u64,
}

/// Factory for per-room routing contexts
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(&self, codecs: &[CodecSpec]) -> Result<Arc<dyn RouterHandle>>;
}

/// Per-room routing context through which all of the room's media is relayed
#[async_trait]
pub trait RouterHandle: Send + Sync {
    /// Receive-capabilities descriptor clients need before consuming
    fn rtp_capabilities(&self) -> Value;

    async fn create_transport(&self, options: &TransportOptions)
        -> Result<Arc<dyn TransportHandle>>;

    /// Whether a receiver with the given capability set can be fed the named
    /// producer's media.
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool;

    async fn close(&self) -> Result<()>;
}

/// A negotiated network path between one peer and the routing context
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> TransportId;
    fn ice_parameters(&self) -> Value;
    fn ice_candidates(&self) -> Value;
    fn dtls_parameters(&self) -> Value;

    /// Finalize DTLS role negotiation with the remote side's parameters.
    async fn connect(&self, dtls_parameters: Value) -> Result<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<Arc<dyn ProducerHandle>>;

    /// Create a consumer for the named producer. Consumers start paused.
    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
    ) -> Result<Arc<dyn ConsumerHandle>>;

    async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<()>;

    async fn stats(&self) -> Result<TransportStats>;

    async fn close(&self) -> Result<()>;
}

/// One outbound media stream published onto a send transport
#[async_trait]
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;

    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// One inbound media stream delivered to a receive transport
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    /// Delivery flavor, e.g. "simple" or "simulcast"
    fn consumer_type(&self) -> String;
    fn paused(&self) -> bool;
    fn producer_paused(&self) -> bool;

    async fn resume(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

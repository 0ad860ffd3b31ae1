//! In-process media engine
//!
//! Stands in for a real RTC stack behind the [`MediaEngine`] capability set:
//! mints ICE/DTLS parameter blobs, enforces pause/close/can-consume
//! semantics, and serves transport statistics that tests (and the
//! development server) can inject. No packets move anywhere.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    CodecSpec, ConsumerHandle, MediaEngine, ProducerHandle, RouterHandle, TransportHandle,
    TransportOptions, TransportStats,
};
use crate::error::{Error, Result};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

const HEX: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

fn fake_fingerprint() -> String {
    let raw = nanoid::nanoid!(64, &HEX);
    raw.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_uppercase())
        .collect::<Vec<_>>()
        .join(":")
}

type ProducerDirectory = Arc<RwLock<HashMap<ProducerId, Arc<ProducerState>>>>;
type TransportRegistry = Arc<DashMap<TransportId, Arc<LoopbackTransport>>>;

/// In-process engine; hands out loopback routers and keeps a registry of
/// every transport it ever created so state can be inspected and stats
/// injected from the outside.
pub struct LoopbackEngine {
    transports: TransportRegistry,
    routers_created: AtomicUsize,
    next_port: Arc<AtomicU16>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            transports: Arc::new(DashMap::new()),
            routers_created: AtomicUsize::new(0),
            next_port: Arc::new(AtomicU16::new(40_000)),
        }
    }

    /// Number of routers created over the engine's lifetime.
    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::SeqCst)
    }

    /// Replace the statistics snapshot the named transport will report.
    pub fn inject_stats(&self, transport_id: &TransportId, stats: TransportStats) {
        if let Some(transport) = self.transports.get(transport_id) {
            *transport.stats.lock() = stats;
        }
    }

    /// Current outgoing-bitrate ceiling set on the named transport, if any.
    #[must_use]
    pub fn max_outgoing_bitrate(&self, transport_id: &TransportId) -> Option<u32> {
        self.transports
            .get(transport_id)
            .and_then(|t| *t.max_outgoing_bitrate.lock())
    }

    /// Ids of every transport ever created through this engine.
    #[must_use]
    pub fn transport_ids(&self) -> Vec<TransportId> {
        self.transports.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn is_transport_closed(&self, transport_id: &TransportId) -> bool {
        self.transports
            .get(transport_id)
            .map_or(true, |t| t.closed.load(Ordering::SeqCst))
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(&self, codecs: &[CodecSpec]) -> Result<Arc<dyn RouterHandle>> {
        self.routers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackRouter {
            capabilities: json!({
                "codecs": serde_json::to_value(codecs)?,
                "headerExtensions": [],
            }),
            producers: Arc::new(RwLock::new(HashMap::new())),
            transports: Arc::clone(&self.transports),
            next_port: Arc::clone(&self.next_port),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackRouter {
    capabilities: Value,
    producers: ProducerDirectory,
    transports: TransportRegistry,
    next_port: Arc<AtomicU16>,
    closed: AtomicBool,
}

#[async_trait]
impl RouterHandle for LoopbackRouter {
    fn rtp_capabilities(&self) -> Value {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn TransportHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("routing context closed".to_string()));
        }

        let id = TransportId::generate();
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(LoopbackTransport {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": nanoid::nanoid!(8),
                "password": nanoid::nanoid!(22),
                "iceLite": true,
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079u32,
                "ip": options.announced_ip,
                "protocol": if options.prefer_udp { "udp" } else { "tcp" },
                "port": port,
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": fake_fingerprint() }],
            }),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            max_outgoing_bitrate: Mutex::new(None),
            stats: Mutex::new(TransportStats::default()),
            producers: Arc::clone(&self.producers),
        });
        self.transports.insert(id, Arc::clone(&transport));
        Ok(transport)
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let Some(producer) = self.producers.read().get(producer_id).cloned() else {
            return false;
        };
        if producer.closed.load(Ordering::SeqCst) {
            return false;
        }

        // The receiver qualifies when it declares at least one codec of the
        // producer's media kind.
        let prefix = match producer.kind {
            MediaKind::Audio => "audio/",
            MediaKind::Video => "video/",
        };
        rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| {
                codecs.iter().any(|codec| {
                    codec
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .is_some_and(|mime| mime.to_lowercase().starts_with(prefix))
                })
            })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ProducerState {
    id: ProducerId,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
}

struct LoopbackTransport {
    id: TransportId,
    ice_parameters: Value,
    ice_candidates: Value,
    dtls_parameters: Value,
    connected: AtomicBool,
    closed: AtomicBool,
    max_outgoing_bitrate: Mutex<Option<u32>>,
    stats: Mutex<TransportStats>,
    producers: ProducerDirectory,
}

#[async_trait]
impl TransportHandle for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn ice_parameters(&self) -> Value {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Value {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> Value {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, _dtls_parameters: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("transport closed".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: Value,
    ) -> Result<Arc<dyn ProducerHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("transport closed".to_string()));
        }
        let state = Arc::new(ProducerState {
            id: ProducerId::generate(),
            kind,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.producers
            .write()
            .insert(state.id.clone(), Arc::clone(&state));
        Ok(Arc::new(LoopbackProducer {
            state,
            directory: Arc::clone(&self.producers),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        _rtp_capabilities: Value,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("transport closed".to_string()));
        }
        let producer = self
            .producers
            .read()
            .get(producer_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("producer {producer_id} not found")))?;
        if producer.closed.load(Ordering::SeqCst) {
            return Err(Error::NotFound(format!("producer {producer_id} not found")));
        }

        let kind = producer.kind;
        Ok(Arc::new(LoopbackConsumer {
            id: ConsumerId::generate(),
            kind,
            rtp_parameters: json!({
                "codecs": [],
                "encodings": [{ "ssrc": 0 }],
                "mid": Value::Null,
            }),
            producer,
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("transport closed".to_string()));
        }
        *self.max_outgoing_bitrate.lock() = Some(bitrate);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("transport closed".to_string()));
        }
        Ok(*self.stats.lock())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct LoopbackProducer {
    state: Arc<ProducerState>,
    directory: ProducerDirectory,
}

#[async_trait]
impl ProducerHandle for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.state.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.state.kind
    }

    fn paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("producer closed".to_string()));
        }
        self.state.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("producer closed".to_string()));
        }
        self.state.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.directory.write().remove(&self.state.id);
        Ok(())
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    kind: MediaKind,
    rtp_parameters: Value,
    producer: Arc<ProducerState>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl ConsumerHandle for LoopbackConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> String {
        "simple".to_string()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("consumer closed".to_string()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::default_codec_set;

    fn options() -> TransportOptions {
        TransportOptions::from(&crate::config::TransportConfig::default())
    }

    fn audio_caps() -> Value {
        json!({ "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000 }] })
    }

    #[tokio::test]
    async fn test_router_capabilities_carry_codecs() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(&default_codec_set()).await.unwrap();
        let caps = router.rtp_capabilities();
        let codecs = caps.get("codecs").and_then(Value::as_array).unwrap();
        assert_eq!(codecs.len(), 4);
        assert_eq!(engine.routers_created(), 1);
    }

    #[tokio::test]
    async fn test_consumer_starts_paused() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(&default_codec_set()).await.unwrap();
        let transport = router.create_transport(&options()).await.unwrap();

        let producer = transport
            .produce(MediaKind::Audio, Value::Null)
            .await
            .unwrap();
        let consumer = transport
            .consume(&producer.id(), audio_caps())
            .await
            .unwrap();

        assert!(consumer.paused());
        assert!(!consumer.producer_paused());

        consumer.resume().await.unwrap();
        assert!(!consumer.paused());
    }

    #[tokio::test]
    async fn test_producer_paused_visible_through_consumer() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(&default_codec_set()).await.unwrap();
        let transport = router.create_transport(&options()).await.unwrap();

        let producer = transport
            .produce(MediaKind::Video, Value::Null)
            .await
            .unwrap();
        producer.pause().await.unwrap();

        let caps = json!({ "codecs": [{ "mimeType": "video/VP8" }] });
        let consumer = transport.consume(&producer.id(), caps).await.unwrap();
        assert!(consumer.producer_paused());
    }

    #[tokio::test]
    async fn test_can_consume_requires_matching_kind() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(&default_codec_set()).await.unwrap();
        let transport = router.create_transport(&options()).await.unwrap();

        let producer = transport
            .produce(MediaKind::Video, Value::Null)
            .await
            .unwrap();

        assert!(router.can_consume(
            &producer.id(),
            &json!({ "codecs": [{ "mimeType": "video/VP8" }] })
        ));
        // Audio-only receiver cannot take a video producer.
        assert!(!router.can_consume(&producer.id(), &audio_caps()));
        // Empty capability set never qualifies.
        assert!(!router.can_consume(&producer.id(), &json!({ "codecs": [] })));
    }

    #[tokio::test]
    async fn test_consume_after_producer_close_fails() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(&default_codec_set()).await.unwrap();
        let transport = router.create_transport(&options()).await.unwrap();

        let producer = transport
            .produce(MediaKind::Audio, Value::Null)
            .await
            .unwrap();
        let producer_id = producer.id();
        producer.close().await.unwrap();

        assert!(!router.can_consume(&producer_id, &audio_caps()));
        let result = transport.consume(&producer_id, audio_caps()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_operations() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(&default_codec_set()).await.unwrap();
        let transport = router.create_transport(&options()).await.unwrap();

        transport.close().await.unwrap();
        assert!(engine.is_transport_closed(&transport.id()));
        assert!(transport.produce(MediaKind::Audio, Value::Null).await.is_err());
        assert!(transport.connect(Value::Null).await.is_err());
        assert!(transport.stats().await.is_err());
    }

    #[tokio::test]
    async fn test_stats_injection() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(&default_codec_set()).await.unwrap();
        let transport = router.create_transport(&options()).await.unwrap();

        engine.inject_stats(
            &transport.id(),
            TransportStats {
                rtt_ms: 42.0,
                packets_sent: 100,
                packets_lost: 1,
                bytes_sent: 50_000,
                timestamp_ms: 1_000,
            },
        );

        let stats = transport.stats().await.unwrap();
        assert_eq!(stats.rtt_ms, 42.0);
        assert_eq!(stats.bytes_sent, 50_000);
    }
}

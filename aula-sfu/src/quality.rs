//! Adaptive quality control loop
//!
//! Every few seconds the controller pulls raw statistics from each open
//! send transport, derives round-trip time, packet loss and an
//! instantaneous bandwidth estimate, averages them per room, and picks a
//! quality tier. The bandwidth estimate is a plain delta against the
//! immediately preceding sample, with no smoothing window, so the decision
//! tracks the link as-is, single-interval noise included.
//!
//! Tier selection is a pure function of the averages and the participant
//! count; room size only ever lowers the tier chosen from network
//! conditions, never raises it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::ServerEvent;
use crate::manager::SfuManager;
use crate::types::TransportId;

/// Quality bucket for the room's outgoing streams.
///
/// Variant order is the tier order: comparisons treat `Minimal` as the
/// lowest tier and `High` as the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Minimal,
    Low,
    Medium,
    High,
}

/// Capture resolution and frame-rate targets for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoEnvelope {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl QualityTier {
    #[must_use]
    pub const fn envelope(self) -> VideoEnvelope {
        match self {
            Self::High => VideoEnvelope {
                width: 1280,
                height: 720,
                framerate: 30,
            },
            Self::Medium => VideoEnvelope {
                width: 640,
                height: 480,
                framerate: 25,
            },
            Self::Low => VideoEnvelope {
                width: 320,
                height: 240,
                framerate: 20,
            },
            Self::Minimal => VideoEnvelope {
                width: 160,
                height: 120,
                framerate: 15,
            },
        }
    }

    /// Bitrate ceiling for outbound video at this tier, bits per second.
    #[must_use]
    pub const fn max_bitrate(self) -> u32 {
        match self {
            Self::High => 2_500_000,
            Self::Medium => 1_000_000,
            Self::Low => 400_000,
            Self::Minimal => 150_000,
        }
    }
}

/// Room-wide averages over the transports that reported in a round
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkAverages {
    pub rtt_ms: f64,
    /// Packet loss ratio, 0.0 - 1.0
    pub packet_loss: f64,
    pub bandwidth_bps: f64,
}

/// Pick a tier from network conditions alone. Thresholds are evaluated
/// top-down; anything that fails both gated tiers falls through on
/// bandwidth alone.
#[must_use]
pub fn select_tier(averages: &NetworkAverages) -> QualityTier {
    if averages.rtt_ms < 150.0 && averages.packet_loss < 0.02 && averages.bandwidth_bps > 2_500_000.0
    {
        QualityTier::High
    } else if averages.rtt_ms < 300.0
        && averages.packet_loss < 0.05
        && averages.bandwidth_bps > 1_000_000.0
    {
        QualityTier::Medium
    } else if averages.bandwidth_bps > 400_000.0 {
        QualityTier::Low
    } else {
        QualityTier::Minimal
    }
}

/// Clamp a tier by room size. A ceiling only: large rooms can lower the
/// tier, never raise it.
#[must_use]
pub fn clamp_for_room_size(tier: QualityTier, participant_count: usize) -> QualityTier {
    let ceiling = if participant_count > 8 {
        QualityTier::Low
    } else if participant_count > 4 {
        QualityTier::Medium
    } else {
        QualityTier::High
    };
    tier.min(ceiling)
}

/// The full tier decision: network selection, then the room-size ceiling.
#[must_use]
pub fn decide(averages: &NetworkAverages, participant_count: usize) -> QualityTier {
    clamp_for_room_size(select_tier(averages), participant_count)
}

struct PreviousSample {
    bytes_sent: u64,
    timestamp_ms: u64,
}

/// Holds the previous statistics snapshot per transport so each round can
/// compute its bandwidth delta.
pub(crate) struct QualityController {
    previous: HashMap<TransportId, PreviousSample>,
}

impl QualityController {
    pub(crate) fn new() -> Self {
        Self {
            previous: HashMap::new(),
        }
    }

    /// One collection round over every room. A transport contributes to its
    /// room's averages only once a previous sample exists; stats pulls that
    /// exceed the per-transport budget are excluded from the round.
    pub(crate) async fn run_once(&mut self, manager: &SfuManager) {
        let budget = Duration::from_millis(manager.config().quality.stats_timeout_ms);
        let mut seen: HashSet<TransportId> = HashSet::new();

        for room in manager.registry().rooms() {
            let peers = room.peers();
            let participant_count = peers.len();

            let mut rtt_sum = 0.0;
            let mut loss_sum = 0.0;
            let mut bandwidth_sum = 0.0;
            let mut contributors = 0u32;

            for peer in &peers {
                let Some(transport) = peer.send_transport() else {
                    continue;
                };
                let transport_id = transport.id();

                let stats = match tokio::time::timeout(budget, transport.stats()).await {
                    Ok(Ok(stats)) => stats,
                    Ok(Err(e)) => {
                        debug!(transport_id = %transport_id, error = %e, "stats pull failed");
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            transport_id = %transport_id,
                            "stats pull exceeded budget, excluding from round"
                        );
                        continue;
                    }
                };

                seen.insert(transport_id.clone());
                let previous = self.previous.insert(
                    transport_id,
                    PreviousSample {
                        bytes_sent: stats.bytes_sent,
                        timestamp_ms: stats.timestamp_ms,
                    },
                );
                let Some(previous) = previous else {
                    continue;
                };
                if stats.timestamp_ms <= previous.timestamp_ms {
                    continue;
                }

                let elapsed_secs = (stats.timestamp_ms - previous.timestamp_ms) as f64 / 1_000.0;
                let bandwidth =
                    stats.bytes_sent.saturating_sub(previous.bytes_sent) as f64 * 8.0 / elapsed_secs;
                let total_packets = stats.packets_sent + stats.packets_lost;
                let loss = if total_packets > 0 {
                    stats.packets_lost as f64 / total_packets as f64
                } else {
                    0.0
                };

                rtt_sum += stats.rtt_ms;
                loss_sum += loss;
                bandwidth_sum += bandwidth;
                contributors += 1;
            }

            if contributors == 0 {
                continue;
            }

            let averages = NetworkAverages {
                rtt_ms: rtt_sum / f64::from(contributors),
                packet_loss: loss_sum / f64::from(contributors),
                bandwidth_bps: bandwidth_sum / f64::from(contributors),
            };
            let decision = decide(&averages, participant_count);

            if decision != room.current_tier() {
                room.set_tier(decision);
                info!(
                    room_id = %room.id,
                    tier = ?decision,
                    avg_rtt_ms = averages.rtt_ms,
                    avg_packet_loss = averages.packet_loss,
                    avg_bandwidth_bps = averages.bandwidth_bps,
                    participant_count,
                    "adjusting quality tier"
                );
                self.apply(&room, decision).await;
            }
        }

        self.previous.retain(|id, _| seen.contains(id));
    }

    /// Push the new tier to the room: clients get the capture envelope,
    /// every send transport gets the bitrate ceiling. One transport failing
    /// never aborts the rest.
    async fn apply(&self, room: &crate::room::Room, tier: QualityTier) {
        let bitrate = tier.max_bitrate();
        room.broadcast(
            &ServerEvent::QualityChanged {
                tier,
                video: tier.envelope(),
                max_bitrate: bitrate,
            },
            None,
        );

        for peer in room.peers() {
            if let Some(transport) = peer.send_transport() {
                if let Err(e) = transport.set_max_outgoing_bitrate(bitrate).await {
                    warn!(
                        peer_id = %peer.id,
                        error = %e,
                        "failed to apply bitrate ceiling"
                    );
                }
            }
        }
    }
}

/// Run the control loop until the manager is dropped (it never is in a
/// running server; the task lives for the process lifetime).
pub(crate) fn spawn(manager: Arc<SfuManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval_secs = manager.config().quality.interval_secs;
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        let mut controller = QualityController::new();
        info!(interval_secs, "starting quality control loop");

        loop {
            ticker.tick().await;
            controller.run_once(&manager).await;
        }
    })
}

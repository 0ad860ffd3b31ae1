//! Aula media-session orchestrator
//!
//! This crate implements the server side of a selective-forwarding video
//! room: it accepts peer connections, allocates and wires transports,
//! producers and consumers against a per-room routing context, relays
//! out-of-band room messages, and runs a periodic adaptive-quality control
//! loop over live transport telemetry.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: top-level facade driven by the signaling gateway
//! - **`RoomRegistry` / `Room`**: room table and per-room routing context
//! - **`PeerSession`**: per-connection ownership of transports, producers
//!   and consumers, with a deterministic close cascade
//! - **`MediaEngine`**: trait boundary to the actual RTC stack; parameter
//!   blobs pass through opaquely
//! - **quality loop**: samples send transports, averages rtt / loss /
//!   bandwidth per room, and picks a tier clamped by room size
//!
//! The actual codec/ICE/DTLS work happens behind the [`engine::MediaEngine`]
//! trait; [`engine::loopback::LoopbackEngine`] is the in-process stand-in
//! used for development and tests.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod logging;
pub mod manager;
pub mod peer;
pub mod quality;
pub mod room;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use events::ServerEvent;
pub use exchange::ConsumeSummary;
pub use manager::{JoinSummary, RoomSummary, SfuManager};
pub use quality::{QualityTier, VideoEnvelope};
pub use room::PeerInfo;
pub use transport::TransportDescriptor;
pub use types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId};

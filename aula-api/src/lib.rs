//! Aula signaling gateway
//!
//! HTTP surface (axum): a WebSocket endpoint carrying the signaling
//! protocol, plus health and active-room listings. The wire protocol lives
//! in [`proto`]; the WebSocket demultiplexer in [`http::websocket`].

pub mod http;
pub mod proto;

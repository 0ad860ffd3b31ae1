//! WebSocket signaling endpoint
//!
//! One socket per peer. Inbound frames are demultiplexed to the orchestrator
//! and answered through the correlation id when one was supplied; operation
//! errors become `{id, error}` replies and never cross the connection
//! boundary uncaught. Outbound traffic (replies and room events) flows
//! through a single bounded channel so a slow client applies backpressure
//! instead of interleaving writes. When the socket closes, for any reason,
//! the peer's full teardown runs unconditionally.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::http::AppState;
use crate::proto::{ClientRequest, ReplyEnvelope, RequestEnvelope};
use aula_sfu::{ConsumerId, PeerId, ProducerId, RoomId, SfuManager, TransportId};

/// WebSocket handler for the signaling channel
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Signaling frames are small; 64KB is generous.
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (peer_id, mut events_rx) = state.manager.attach_peer();
    info!(peer_id = %peer_id, "signaling connection established");

    let (mut sink, mut stream) = socket.split();

    // Single outbound pump; replies and events share one ordered channel.
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let _pump = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Forward room events to the outbound pump. Ends when the session is
    // dropped by teardown.
    let events_tx = tx.clone();
    let event_peer = peer_id.clone();
    let _forwarder = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(peer_id = %event_peer, error = %e, "failed to serialize event");
                    continue;
                }
            };
            if events_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_frame(&state, &peer_id, text.as_str(), &tx).await,
            Ok(Message::Close(_)) | Err(_) => break,
            // Binary, ping and pong frames are not part of the protocol.
            Ok(_) => {}
        }
    }

    state.manager.disconnect(&peer_id).await;
    info!(peer_id = %peer_id, "signaling connection closed");
}

async fn handle_frame(state: &AppState, peer_id: &PeerId, raw: &str, tx: &mpsc::Sender<String>) {
    let envelope: RequestEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(peer_id = %peer_id, error = %e, "unparseable frame");
            send_reply(tx, &ReplyEnvelope::err(None, format!("bad request: {e}"))).await;
            return;
        }
    };

    let id = envelope.id;
    let result = dispatch(&state.manager, peer_id, envelope.request).await;

    let Some(id) = id else {
        // Fire-and-forget request (e.g. leave); nothing to correlate.
        if let Err(e) = result {
            debug!(peer_id = %peer_id, error = %e, "uncorrelated request failed");
        }
        return;
    };
    let reply = match result {
        Ok(data) => ReplyEnvelope::ok(id, data),
        Err(e) => ReplyEnvelope::err(Some(id), e.to_string()),
    };
    send_reply(tx, &reply).await;
}

async fn send_reply(tx: &mpsc::Sender<String>, reply: &ReplyEnvelope) {
    match serde_json::to_string(reply) {
        Ok(frame) => {
            // A closed channel means the connection is going away.
            let _ = tx.send(frame).await;
        }
        Err(e) => error!(error = %e, "failed to serialize reply"),
    }
}

/// Route one request to the orchestrator and shape its reply payload.
pub(crate) async fn dispatch(
    manager: &SfuManager,
    peer_id: &PeerId,
    request: ClientRequest,
) -> aula_sfu::Result<Value> {
    match request {
        ClientRequest::Join { room_id, name } => {
            let summary = manager.join(peer_id, RoomId::from(room_id), name).await?;
            Ok(serde_json::to_value(summary)?)
        }
        ClientRequest::CreateTransport { direction } => {
            let descriptor = manager.create_transport(peer_id, direction).await?;
            Ok(serde_json::to_value(descriptor)?)
        }
        ClientRequest::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            manager
                .connect_transport(peer_id, &TransportId::from(transport_id), dtls_parameters)
                .await?;
            Ok(json!({ "connected": true }))
        }
        ClientRequest::Produce {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } => {
            let producer_id = manager
                .produce(
                    peer_id,
                    &TransportId::from(transport_id),
                    kind,
                    rtp_parameters,
                    app_data,
                )
                .await?;
            Ok(json!({ "id": producer_id }))
        }
        ClientRequest::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            let summary = manager
                .consume(
                    peer_id,
                    &TransportId::from(transport_id),
                    &ProducerId::from(producer_id),
                    rtp_capabilities,
                )
                .await?;
            Ok(serde_json::to_value(summary)?)
        }
        ClientRequest::ResumeConsumer { consumer_id } => {
            manager
                .resume_consumer(peer_id, &ConsumerId::from(consumer_id))
                .await?;
            Ok(json!({ "ok": true }))
        }
        ClientRequest::PauseProducer { producer_id } => {
            manager
                .pause_producer(peer_id, &ProducerId::from(producer_id))
                .await?;
            Ok(json!({ "ok": true }))
        }
        ClientRequest::ResumeProducer { producer_id } => {
            manager
                .resume_producer(peer_id, &ProducerId::from(producer_id))
                .await?;
            Ok(json!({ "ok": true }))
        }
        ClientRequest::CloseProducer { producer_id } => {
            manager
                .close_producer(peer_id, &ProducerId::from(producer_id))
                .await?;
            Ok(json!({ "ok": true }))
        }
        ClientRequest::Leave => {
            manager.leave(peer_id).await?;
            Ok(Value::Null)
        }
        ClientRequest::ChatMessage { message } => {
            manager.chat(peer_id, message)?;
            Ok(json!({ "ok": true }))
        }
        ClientRequest::RaiseHand => {
            manager.raise_hand(peer_id)?;
            Ok(json!({ "ok": true }))
        }
        ClientRequest::LowerHand => {
            manager.lower_hand(peer_id)?;
            Ok(json!({ "ok": true }))
        }
        ClientRequest::SetScreenSharing { sharing } => {
            manager.set_screen_sharing(peer_id, sharing)?;
            Ok(json!({ "ok": true }))
        }
        ClientRequest::MuteParticipant { peer_id: target } => {
            manager.mute_participant(peer_id, &PeerId::from(target))?;
            Ok(json!({ "ok": true }))
        }
    }
}

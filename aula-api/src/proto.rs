//! Wire protocol for the signaling channel
//!
//! Frames are JSON text. A client request carries an optional numeric
//! correlation `id`; the reply echoes it with either `data` or `error`.
//! Requests without an `id` get no reply. Server events are uncorrelated
//! `{type, data}` frames serialized straight from
//! [`aula_sfu::ServerEvent`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use aula_sfu::{MediaKind, TransportDirection};

/// Inbound frame: correlation id plus the request itself
#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientRequest {
    Join {
        room_id: String,
        name: String,
    },
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        #[serde(default)]
        app_data: Value,
    },
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    ResumeConsumer {
        consumer_id: String,
    },
    PauseProducer {
        producer_id: String,
    },
    ResumeProducer {
        producer_id: String,
    },
    CloseProducer {
        producer_id: String,
    },
    Leave,
    ChatMessage {
        message: String,
    },
    RaiseHand,
    LowerHand,
    SetScreenSharing {
        sharing: bool,
    },
    MuteParticipant {
        peer_id: String,
    },
}

/// Outbound reply frame, correlated to a request by `id`
#[derive(Debug, Serialize)]
pub struct ReplyEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplyEnvelope {
    #[must_use]
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id: Some(id),
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn err(id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            id,
            data: None,
            error: Some(message.into()),
        }
    }
}

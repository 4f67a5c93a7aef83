//! Ephemeral bus events. Never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jid::Jid;
use crate::model::{Chat, Message};

/// Discriminant used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageReceived,
    MessageSent,
    MessageRead,
    ChatUpdated,
    ConnectionStatus,
    PairingQr,
    PairingCode,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::MessageSent => "message_sent",
            Self::MessageRead => "message_read",
            Self::ChatUpdated => "chat_updated",
            Self::ConnectionStatus => "connection_status",
            Self::PairingQr => "pairing_qr",
            Self::PairingCode => "pairing_code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "message_received" => Self::MessageReceived,
            "message_sent" => Self::MessageSent,
            "message_read" => Self::MessageRead,
            "chat_updated" => Self::ChatUpdated,
            "connection_status" => Self::ConnectionStatus,
            "pairing_qr" => Self::PairingQr,
            "pairing_code" => Self::PairingCode,
            _ => return None,
        })
    }
}

/// Event payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    MessageReceived { message: Message },
    MessageSent { message: Message },
    MessageRead { chat_jid: Jid, message_ids: Vec<String> },
    ChatUpdated { chat: Chat },
    ConnectionStatus { connected: bool, reason: String },
    PairingQr { code: String },
    PairingCode { code: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived { .. } => EventKind::MessageReceived,
            Self::MessageSent { .. } => EventKind::MessageSent,
            Self::MessageRead { .. } => EventKind::MessageRead,
            Self::ChatUpdated { .. } => EventKind::ChatUpdated,
            Self::ConnectionStatus { .. } => EventKind::ConnectionStatus,
            Self::PairingQr { .. } => EventKind::PairingQr,
            Self::PairingCode { .. } => EventKind::PairingCode,
        }
    }
}

/// A bus event: payload plus emit timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn now(payload: EventPayload) -> Self {
        Self {
            payload,
            emitted_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The payload fields as a bare JSON object, without the variant tag.
    /// Transports wrap this in their own envelopes.
    pub fn data_json(&self) -> serde_json::Value {
        match serde_json::to_value(&self.payload) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .next()
                .map(|(_, inner)| inner)
                .unwrap_or(serde_json::Value::Null),
            Ok(other) => other,
            Err(_) => serde_json::Value::Null,
        }
    }
}

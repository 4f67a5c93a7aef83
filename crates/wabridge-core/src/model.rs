//! Persisted domain records: messages and chats.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::jid::Jid;

/// Maximum tolerated sender-clock skew. Timestamps further in the future are
/// clamped, not rejected.
pub const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Kind of message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Reaction,
    Location,
    Contact,
}

impl MessageKind {
    /// Stable lowercase name used in the database `kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Reaction => "reaction",
            Self::Location => "location",
            Self::Contact => "contact",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "text" => Self::Text,
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            "document" => Self::Document,
            "sticker" => Self::Sticker,
            "reaction" => Self::Reaction,
            "location" => Self::Location,
            "contact" => Self::Contact,
            _ => return None,
        })
    }
}

/// An emoji reaction attached to another message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub target_message_id: String,
    pub emoji: String,
    pub sender_jid: Jid,
}

/// A shared location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
    pub address: Option<String>,
}

/// A shared contact card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactCard {
    pub name: String,
    pub phone: Option<String>,
    pub vcard: Option<String>,
}

/// A single stored message. Immutable after insert except for `is_read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Library-assigned id, globally unique within the paired account.
    pub id: String,
    pub chat_jid: Jid,
    pub sender_jid: Jid,
    pub kind: MessageKind,
    pub text: String,
    pub caption: String,
    pub media_url: String,
    pub media_mime_type: String,
    pub media_file_name: String,
    pub media_file_size: i64,
    /// Sender wall clock, UTC, clamped against future skew at ingest.
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    pub is_read: bool,
    pub quoted_message_id: Option<String>,
    pub reaction: Option<Reaction>,
    pub location: Option<Location>,
    pub contact_card: Option<ContactCard>,
}

impl Message {
    /// Build a plain text message with the given identity fields.
    pub fn text(id: impl Into<String>, chat_jid: Jid, sender_jid: Jid, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat_jid,
            sender_jid,
            kind: MessageKind::Text,
            text: text.into(),
            caption: String::new(),
            media_url: String::new(),
            media_mime_type: String::new(),
            media_file_name: String::new(),
            media_file_size: 0,
            timestamp: Utc::now(),
            is_from_me: false,
            is_read: false,
            quoted_message_id: None,
            reaction: None,
            location: None,
            contact_card: None,
        }
    }

    /// Normalize invariants that hold for every stored row:
    /// own messages are read, and timestamps never run more than
    /// [`MAX_CLOCK_SKEW_SECS`] ahead of the local clock.
    pub fn normalize(mut self) -> Self {
        if self.is_from_me {
            self.is_read = true;
        }
        let ceiling = Utc::now() + Duration::seconds(MAX_CLOCK_SKEW_SECS);
        if self.timestamp > ceiling {
            self.timestamp = ceiling;
        }
        self
    }
}

/// Kind of chat, derived from the JID server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
}

impl ChatKind {
    pub fn of(jid: &Jid) -> Self {
        if jid.is_group() {
            Self::Group
        } else {
            Self::Private
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// A conversation summary row, materialized from its messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub jid: Jid,
    pub kind: ChatKind,
    pub name: String,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_text: String,
    pub last_message_sender: Option<Jid>,
    pub unread_count: i64,
    pub is_muted: bool,
    pub is_archived: bool,
    pub is_pinned: bool,
    /// Group participants; empty for private chats.
    pub participants: Vec<Jid>,
}

impl Chat {
    /// A fresh chat row for a JID with no stored messages yet.
    pub fn new(jid: Jid) -> Self {
        let kind = ChatKind::of(&jid);
        Self {
            jid,
            kind,
            name: String::new(),
            last_message_time: None,
            last_message_text: String::new(),
            last_message_sender: None,
            unread_count: 0,
            is_muted: false,
            is_archived: false,
            is_pinned: false,
            participants: Vec::new(),
        }
    }
}
